//! iptables provisioning: steer probe traffic into the capture queue.
//!
//! Rules live in the `raw` table's `PREROUTING` chain, one per transport,
//! matching traffic from the peer's port to our own port.

use std::{io, process::Command};

use thiserror::Error;

use crate::{headers::Protocol, roles::Role};

const IPTABLES: &str = "iptables";
const TABLE: &str = "raw";
const CHAIN: &str = "PREROUTING";

/// Fragments of iptables stderr meaning "the checked rule does not exist".
const MISSING_RULE_MARKERS: [&str; 2] = ["No chain/target/match", "does a matching rule exist"];

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Cannot run iptables: {0}")]
    Spawn(#[from] io::Error),
    #[error("iptables {args} failed: {stderr}")]
    Failed { args: String, stderr: String },
}

/// Chain operation for one iptables invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOp {
    /// `-C`: check whether the rule exists.
    Check,
    /// `-A`: append the rule.
    Append,
}

impl ChainOp {
    fn flag(self) -> &'static str {
        match self {
            ChainOp::Check => "-C",
            ChainOp::Append => "-A",
        }
    }
}

/// One queue rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSpec {
    pub protocol: Protocol,
    /// Source port of matched traffic (the peer's port).
    pub src_port: u16,
    /// Destination port of matched traffic (our port).
    pub dst_port: u16,
    pub queue_num: u16,
}

/// Rules steering traffic addressed to `role` into `queue_num`, for both transports.
pub fn rules_for(role: Role, initiator_port: u16, responder_port: u16, queue_num: u16) -> [RuleSpec; 2] {
    let (src_port, dst_port) = match role {
        Role::Initiator => (responder_port, initiator_port),
        Role::Responder => (initiator_port, responder_port),
    };
    [Protocol::Tcp, Protocol::Udp].map(|protocol| RuleSpec {
        protocol,
        src_port,
        dst_port,
        queue_num,
    })
}

/// Builds the iptables argument vector for `op` on `rule`.
pub fn rule_args(op: ChainOp, rule: &RuleSpec) -> Vec<String> {
    vec![
        "-t".to_string(),
        TABLE.to_string(),
        op.flag().to_string(),
        CHAIN.to_string(),
        "-p".to_string(),
        rule.protocol.to_string(),
        "--sport".to_string(),
        rule.src_port.to_string(),
        "--dport".to_string(),
        rule.dst_port.to_string(),
        "-j".to_string(),
        "NFQUEUE".to_string(),
        "--queue-num".to_string(),
        rule.queue_num.to_string(),
    ]
}

/// True when a failed check's stderr says the rule is absent.
pub fn is_missing_rule(stderr: &str) -> bool {
    MISSING_RULE_MARKERS.iter().any(|m| stderr.contains(m))
}

/// Installs every rule in `rules` that is not already present.
pub fn ensure_rules(rules: &[RuleSpec]) -> Result<(), RuleError> {
    for rule in rules {
        ensure_rule(rule)?;
    }
    Ok(())
}

fn ensure_rule(rule: &RuleSpec) -> Result<(), RuleError> {
    let check = rule_args(ChainOp::Check, rule);
    log::debug!("exec: {} {}", IPTABLES, check.join(" "));
    let output = Command::new(IPTABLES).args(&check).output()?;
    if output.status.success() {
        log::debug!("Rule already present: {}", check.join(" "));
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !is_missing_rule(&stderr) {
        return Err(RuleError::Failed {
            args: check.join(" "),
            stderr: stderr.trim().to_string(),
        });
    }

    let append = rule_args(ChainOp::Append, rule);
    log::debug!("exec: {} {}", IPTABLES, append.join(" "));
    let output = Command::new(IPTABLES).args(&append).output()?;
    if !output.status.success() {
        return Err(RuleError::Failed {
            args: append.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    log::info!(
        "Installed {} rule {} -> {} into queue {}",
        rule.protocol,
        rule.src_port,
        rule.dst_port,
        rule.queue_num
    );
    Ok(())
}
