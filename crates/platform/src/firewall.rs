//! `iptables` command runner implementing the [`Firewall`] capability.
//!
//! The rule manager talks to the host packet filter exactly the way the
//! `iptables` userspace tool does: one short-lived process per mutation.
//! Rule specifications arrive pre-tokenized, so no shell quoting is involved.

use tokio::process::Command;

use crate::error::{MeshguardError, MeshguardResult};
use crate::traits::Firewall;

/// Runs the `iptables` binary to manage tables, chains, and rules.
pub struct IptablesCmd {
    program: String,
}

impl IptablesCmd {
    /// Use the `iptables` binary found on `PATH`.
    pub fn new() -> Self {
        Self::with_program("iptables")
    }

    /// Use a specific binary, e.g. `iptables-legacy` or an absolute path.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run the program, failing on any non-zero exit status.
    async fn run(&self, args: &[&str]) -> MeshguardResult<()> {
        tracing::debug!(program = %self.program, ?args, "packet filter update");
        let output = Command::new(&self.program).args(args).output().await?;
        if output.status.success() {
            return Ok(());
        }
        Err(MeshguardError::Command {
            program: self.program.clone(),
            detail: format!(
                "{:?} exited with {}: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }

    /// Run a check command: exit 0 means yes, exit 1 means no.
    async fn run_check(&self, args: &[&str]) -> MeshguardResult<bool> {
        let output = Command::new(&self.program).args(args).output().await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(MeshguardError::Command {
                program: self.program.clone(),
                detail: format!(
                    "{:?} exited with {}: {}",
                    args,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    fn args<'a>(table: &'a str, op: &'a str, chain: &'a str, spec: &'a [String]) -> Vec<&'a str> {
        let mut args = vec!["-t", table, op, chain];
        args.extend(spec.iter().map(String::as_str));
        args
    }
}

impl Default for IptablesCmd {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Firewall for IptablesCmd {
    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<()> {
        self.run(&Self::args(table, "-A", chain, spec)).await
    }

    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> MeshguardResult<()> {
        if self.exists(table, chain, spec).await? {
            return Ok(());
        }
        self.append(table, chain, spec).await
    }

    async fn insert(
        &self,
        table: &str,
        chain: &str,
        pos: u32,
        spec: &[String],
    ) -> MeshguardResult<()> {
        let pos = pos.to_string();
        let mut args = vec!["-t", table, "-I", chain, &pos];
        args.extend(spec.iter().map(String::as_str));
        self.run(&args).await
    }

    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<()> {
        self.run(&Self::args(table, "-D", chain, spec)).await
    }

    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<bool> {
        self.run_check(&Self::args(table, "-C", chain, spec)).await
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> MeshguardResult<()> {
        // Create-or-flush: `-N` fails when the chain exists, in which case
        // flushing it gives the same end state.
        if self.run(&["-t", table, "-N", chain]).await.is_ok() {
            return Ok(());
        }
        self.run(&["-t", table, "-F", chain]).await
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> MeshguardResult<()> {
        self.run(&["-t", table, "-X", chain]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_building() {
        let spec = vec!["-p".to_string(), "esp".to_string(), "-j".to_string(), "DROP".to_string()];
        let args = IptablesCmd::args("mangle", "-A", "CHAIN", &spec);
        assert_eq!(args, ["-t", "mangle", "-A", "CHAIN", "-p", "esp", "-j", "DROP"]);
    }

    #[test]
    fn test_custom_program() {
        let ipt = IptablesCmd::with_program("iptables-legacy");
        assert_eq!(ipt.program, "iptables-legacy");
    }
}
