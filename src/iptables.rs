//! A real packet-filter driver that shells out to `iptables`/`ip6tables`.
//!
//! The driver is explicitly out of core scope (`spec.md` §1): the core only
//! declares the `IptablesDriver` trait and ships a recording test double.
//! This is the glue binary's concrete implementation, grounded in the same
//! "shell out, inspect stderr for known not-found phrasing" pattern the
//! teacher's own driver collaborators use for fallible external processes.

use std::process::Command;

use svcproxy_core::filter::{DriverError, IptablesDriver, Position, Table};

pub struct ShellIptablesDriver {
    binary: &'static str,
}

impl ShellIptablesDriver {
    /// The IPv4 driver. IPv6 is best-effort per `spec.md`'s non-goals; a
    /// second instance pointed at `ip6tables` can be layered on by the
    /// caller if needed.
    pub fn ipv4() -> Self {
        Self { binary: "iptables" }
    }

    fn run(&self, args: &[&str]) -> Result<(), DriverError> {
        let output = Command::new(self.binary)
            .args(args)
            .output()
            .map_err(|err| DriverError {
                message: format!("failed to spawn {}: {err}", self.binary),
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(DriverError {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn table_arg(table: Table) -> &'static str {
        match table {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

impl IptablesDriver for ShellIptablesDriver {
    fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool, DriverError> {
        match self.run(&["-t", Self::table_arg(table), "-N", chain]) {
            Ok(()) => Ok(false),
            Err(err) if err.message.to_lowercase().contains("already exists") => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn ensure_rule(
        &self,
        position: Position,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<bool, DriverError> {
        let table_arg = Self::table_arg(table);
        let mut check_args: Vec<&str> = vec!["-t", table_arg, "-C", chain];
        check_args.extend(args.iter().map(String::as_str));
        if self.run(&check_args).is_ok() {
            return Ok(true);
        }

        let op = match position {
            Position::Prepend => "-I",
            Position::Append => "-A",
        };
        let mut insert_args: Vec<&str> = vec!["-t", table_arg, op, chain];
        insert_args.extend(args.iter().map(String::as_str));
        self.run(&insert_args).map(|()| false)
    }

    fn delete_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<(), DriverError> {
        let mut delete_args: Vec<&str> = vec!["-t", Self::table_arg(table), "-D", chain];
        delete_args.extend(args.iter().map(String::as_str));
        self.run(&delete_args)
    }

    fn flush_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        self.run(&["-t", Self::table_arg(table), "-F", chain])
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), DriverError> {
        self.run(&["-t", Self::table_arg(table), "-X", chain])
    }

    fn is_not_found_error(&self, err: &DriverError) -> bool {
        let msg = err.message.to_lowercase();
        msg.contains("no chain/target/match by that name")
            || msg.contains("does not exist")
            || msg.contains("no such file or directory")
    }
}
