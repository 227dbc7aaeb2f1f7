//! Packet-filter rule graph enforcing the ESP traffic contract
//!
//! The subsystem owns four private mangle chains and one filter chain:
//!
//! ```text
//! INBOUND (mangle):
//! -A INPUT -j MESHGUARD-IN                                                    # scaffolding
//! -A MESHGUARD-IN -s $remote -d $local -p esp -m esp --espspi $spi \
//!        -j MESHGUARD-IN-MARK                                                 # per peer
//! -A MESHGUARD-IN-MARK -j MARK --set-xmark $mark                              # scaffolding
//!
//! INBOUND (filter):
//! -A INPUT -j MESHGUARD-IN                                                    # scaffolding
//! -A MESHGUARD-IN -s $remote -d $local -p udp --dport $port \
//!        -m mark ! --mark $mark -j DROP                                       # per peer
//!
//! OUTBOUND (mangle):
//! -A OUTPUT -j MESHGUARD-OUT                                                  # scaffolding
//! -A MESHGUARD-OUT -s $local -d $remote -p udp --dport $port \
//!        -j MESHGUARD-OUT-MARK                                                # per peer
//! -A MESHGUARD-OUT-MARK -j MARK --set-xmark $mark                             # scaffolding
//!
//! OUTBOUND (filter):
//! -A OUTPUT ! -p esp -m policy --dir out --pol none -m mark --mark $mark \
//!        -j DROP                                                              # scaffolding
//! ```
//!
//! The last scaffolding rule is the plaintext-bypass guard: a marked packet
//! whose policy lookup found nothing must not leave the host unprotected.
//!
//! Only the ESP-SPI rule is SPI-specific: rekeying appends a fresh copy for
//! the new SPI and leaves the old one until hard expiry. The UDP rules are
//! peer- and port-specific, survive rekeys, and go away on destroy.

use std::net::Ipv4Addr;

use meshguard_platform::{Firewall, Mark, Spi};

use crate::ipsec::error::{Error, FilterOp, Result};

/// Table holding the marking chains.
pub const TABLE_MANGLE: &str = "mangle";
/// Table holding the drop chain and the bypass guard.
pub const TABLE_FILTER: &str = "filter";
/// Inbound chain name (exists in both tables).
pub const CHAIN_IN: &str = "MESHGUARD-IN";
/// Inbound marking chain.
pub const CHAIN_IN_MARK: &str = "MESHGUARD-IN-MARK";
/// Outbound chain.
pub const CHAIN_OUT: &str = "MESHGUARD-OUT";
/// Outbound marking chain.
pub const CHAIN_OUT_MARK: &str = "MESHGUARD-OUT-MARK";

/// One fully rendered rule: table, chain, and tokenized specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Table the rule lives in.
    pub table: &'static str,
    /// Chain the rule is appended to.
    pub chain: &'static str,
    /// Rule specification as `iptables` arguments.
    pub spec: Vec<String>,
}

/// Renders the rule graph for one configured mark value.
#[derive(Debug, Clone)]
pub struct RuleSet {
    mark: String,
}

impl RuleSet {
    /// Build a rule set for the given process mark.
    pub fn new(mark: Mark) -> Self {
        RuleSet {
            mark: mark.to_string(),
        }
    }

    /// The five private chains, as `(table, chain)` pairs.
    pub fn chains() -> [(&'static str, &'static str); 5] {
        [
            (TABLE_MANGLE, CHAIN_IN),
            (TABLE_MANGLE, CHAIN_IN_MARK),
            (TABLE_FILTER, CHAIN_IN),
            (TABLE_MANGLE, CHAIN_OUT),
            (TABLE_MANGLE, CHAIN_OUT_MARK),
        ]
    }

    /// Scaffolding rules installed once at startup.
    pub fn scaffolding(&self) -> Vec<Rule> {
        vec![
            Rule {
                table: TABLE_MANGLE,
                chain: "INPUT",
                spec: strings(&["-j", CHAIN_IN]),
            },
            Rule {
                table: TABLE_MANGLE,
                chain: CHAIN_IN_MARK,
                spec: strings(&["-j", "MARK", "--set-xmark", &self.mark]),
            },
            Rule {
                table: TABLE_FILTER,
                chain: "INPUT",
                spec: strings(&["-j", CHAIN_IN]),
            },
            Rule {
                table: TABLE_MANGLE,
                chain: "OUTPUT",
                spec: strings(&["-j", CHAIN_OUT]),
            },
            Rule {
                table: TABLE_MANGLE,
                chain: CHAIN_OUT_MARK,
                spec: strings(&["-j", "MARK", "--set-xmark", &self.mark]),
            },
            Rule {
                table: TABLE_FILTER,
                chain: "OUTPUT",
                spec: strings(&[
                    "!", "-p", "esp", "-m", "policy", "--dir", "out", "--pol", "none", "-m",
                    "mark", "--mark", &self.mark, "-j", "DROP",
                ]),
            },
        ]
    }

    /// Rule (1): mark inbound ESP from the peer carrying the given SPI.
    pub fn protecting_in_rule(&self, local: Ipv4Addr, remote: Ipv4Addr, spi: Spi) -> Rule {
        Rule {
            table: TABLE_MANGLE,
            chain: CHAIN_IN,
            spec: strings(&[
                "-s",
                &remote.to_string(),
                "-d",
                &local.to_string(),
                "-p",
                "esp",
                "-m",
                "esp",
                "--espspi",
                &format!("0x{:x}", spi.0),
                "-j",
                CHAIN_IN_MARK,
            ]),
        }
    }

    /// All three per-peer rules, in install order.
    pub fn protecting_rules(
        &self,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        dst_port: u16,
        spi: Spi,
    ) -> Vec<Rule> {
        vec![
            self.protecting_in_rule(local, remote, spi),
            Rule {
                table: TABLE_FILTER,
                chain: CHAIN_IN,
                spec: strings(&[
                    "-s",
                    &remote.to_string(),
                    "-d",
                    &local.to_string(),
                    "-p",
                    "udp",
                    "--dport",
                    &dst_port.to_string(),
                    "-m",
                    "mark",
                    "!",
                    "--mark",
                    &self.mark,
                    "-j",
                    "DROP",
                ]),
            },
            Rule {
                table: TABLE_MANGLE,
                chain: CHAIN_OUT,
                spec: strings(&[
                    "-s",
                    &local.to_string(),
                    "-d",
                    &remote.to_string(),
                    "-p",
                    "udp",
                    "--dport",
                    &dst_port.to_string(),
                    "-j",
                    CHAIN_OUT_MARK,
                ]),
            },
        ]
    }
}

fn strings(spec: &[&str]) -> Vec<String> {
    spec.iter().map(|s| s.to_string()).collect()
}

/// Install rules idempotently: a repeat install is a no-op.
pub(crate) async fn install_unique<F: Firewall>(firewall: &F, rules: &[Rule]) -> Result<()> {
    for rule in rules {
        firewall
            .append_unique(rule.table, rule.chain, &rule.spec)
            .await
            .map_err(|e| Error::filter(FilterOp::Append, e))?;
    }
    Ok(())
}

/// Bring rules to the desired presence state: append the missing ones, or on
/// `destroy` delete the present ones. Absent rules are skipped on delete.
pub(crate) async fn reset_rules<F: Firewall>(
    firewall: &F,
    rules: &[Rule],
    destroy: bool,
) -> Result<()> {
    for rule in rules {
        let present = firewall
            .exists(rule.table, rule.chain, &rule.spec)
            .await
            .map_err(|e| Error::filter(FilterOp::Exists, e))?;
        match (destroy, present) {
            (false, false) => {
                firewall
                    .append(rule.table, rule.chain, &rule.spec)
                    .await
                    .map_err(|e| Error::filter(FilterOp::Append, e))?;
            }
            (true, true) => {
                firewall
                    .delete(rule.table, rule.chain, &rule.spec)
                    .await
                    .map_err(|e| Error::filter(FilterOp::Delete, e))?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Remove rules, tolerating ones that are already gone.
pub(crate) async fn remove_rules<F: Firewall>(firewall: &F, rules: &[Rule]) -> Result<()> {
    reset_rules(firewall, rules, true).await
}

/// Clear the private chains and re-assert (or on `destroy` remove) the
/// scaffolding; on `destroy` the chains themselves are deleted too.
pub(crate) async fn reset<F: Firewall>(firewall: &F, set: &RuleSet, destroy: bool) -> Result<()> {
    for (table, chain) in RuleSet::chains() {
        firewall
            .clear_chain(table, chain)
            .await
            .map_err(|e| Error::filter(FilterOp::Clear, e))?;
    }

    reset_rules(firewall, &set.scaffolding(), destroy).await?;

    if destroy {
        for (table, chain) in RuleSet::chains() {
            firewall
                .delete_chain(table, chain)
                .await
                .map_err(|e| Error::filter(FilterOp::DeleteChain, e))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark() -> Mark {
        Mark {
            value: 0x20000,
            mask: 0x20000,
        }
    }

    #[test]
    fn test_protecting_in_rule_orientation() {
        let set = RuleSet::new(mark());
        let rule = set.protecting_in_rule(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            Spi(0x1a2b),
        );

        assert_eq!(rule.table, TABLE_MANGLE);
        assert_eq!(rule.chain, CHAIN_IN);
        // Matches traffic FROM the remote TO the local host.
        assert_eq!(
            rule.spec,
            [
                "-s", "10.0.0.2", "-d", "10.0.0.1", "-p", "esp", "-m", "esp", "--espspi",
                "0x1a2b", "-j", CHAIN_IN_MARK,
            ]
        );
    }

    #[test]
    fn test_protecting_rules_shape() {
        let set = RuleSet::new(mark());
        let rules = set.protecting_rules(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            6783,
            Spi(0x10),
        );

        assert_eq!(rules.len(), 3);

        // Drop rule rejects unmarked UDP from the peer.
        assert_eq!(rules[1].table, TABLE_FILTER);
        assert_eq!(
            rules[1].spec,
            [
                "-s", "10.0.0.2", "-d", "10.0.0.1", "-p", "udp", "--dport", "6783", "-m",
                "mark", "!", "--mark", "0x20000/0x20000", "-j", "DROP",
            ]
        );

        // Outbound marking rule is oriented local -> remote.
        assert_eq!(rules[2].chain, CHAIN_OUT);
        assert_eq!(&rules[2].spec[..4], ["-s", "10.0.0.1", "-d", "10.0.0.2"]);
    }

    #[test]
    fn test_only_rule_one_depends_on_spi() {
        let set = RuleSet::new(mark());
        let local = "10.0.0.1".parse().unwrap();
        let remote = "10.0.0.2".parse().unwrap();

        let a = set.protecting_rules(local, remote, 6783, Spi(1));
        let b = set.protecting_rules(local, remote, 6783, Spi(2));

        assert_ne!(a[0], b[0]);
        assert_eq!(a[1], b[1]);
        assert_eq!(a[2], b[2]);
    }

    #[test]
    fn test_scaffolding() {
        let set = RuleSet::new(mark());
        let rules = set.scaffolding();
        assert_eq!(rules.len(), 6);

        // The plaintext-bypass guard sits in filter OUTPUT.
        let guard = rules.last().unwrap();
        assert_eq!(guard.table, TABLE_FILTER);
        assert_eq!(guard.chain, "OUTPUT");
        assert_eq!(guard.spec[0], "!");
        assert!(guard.spec.contains(&"DROP".to_string()));
    }

    #[test]
    fn test_chain_list() {
        let chains = RuleSet::chains();
        assert_eq!(chains.len(), 5);
        assert!(chains.contains(&(TABLE_FILTER, CHAIN_IN)));
        assert!(!chains.contains(&(TABLE_FILTER, CHAIN_OUT)));
    }
}
