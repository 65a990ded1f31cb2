//! Ordered execution of compiled operations with best-effort rollback
//!
//! nft offers no transaction spanning several independent rule changes, so a
//! multi-step intent is applied one operation at a time. When a step fails, every
//! step already applied for the same intent is inverted in reverse order:
//!
//! - an added rule is deleted by the handle nft echoed back
//! - a deleted rule is re-added with its original expressions, quota counter included
//!
//! Unwind failures are logged and never replace the primary error.

use crate::core::codec::NftRule;
use crate::core::compiler::{Op, Position};
use crate::core::control::{self, ControlPlane};
use crate::core::error::{Error, Result};
use crate::core::model::ChainRef;
use tracing::{error, warn};

/// A step that took effect and how to undo it
#[derive(Debug, Clone)]
enum Applied {
    Added { chain: ChainRef, handle: u64 },
    Deleted { rule: NftRule },
}

impl Applied {
    fn inverse(&self) -> Op {
        match self {
            Applied::Added { chain, handle } => Op::delete(NftRule {
                family: chain.family.clone(),
                table: chain.table.clone(),
                chain: chain.chain.clone(),
                handle: *handle,
                comment: String::new(),
                expr: Vec::new(),
            }),
            Applied::Deleted { rule } => Op::Add {
                chain: rule.chain_ref(),
                expr: rule.expr.clone(),
                comment: rule.comment.clone(),
                position: Position::Append,
            },
        }
    }
}

/// A rule added by a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedRule {
    pub chain: ChainRef,
    pub handle: u64,
}

/// Rules added by a transaction, in operation order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub added: Vec<AddedRule>,
}

impl Outcome {
    /// Handle of the first rule added to `chain`.
    pub fn handle_in(&self, chain: &ChainRef) -> Option<u64> {
        self.added
            .iter()
            .find(|r| &r.chain == chain)
            .map(|r| r.handle)
    }
}

/// Applies `ops` in order, unwinding applied steps if one fails.
///
/// # Errors
///
/// Returns the error of the failing step. The firewall is back to its previous
/// state unless an unwind step failed too, which is logged.
pub async fn execute<C: ControlPlane>(cp: &C, ops: &[Op]) -> Result<Outcome> {
    let mut applied: Vec<Applied> = Vec::with_capacity(ops.len());
    let mut outcome = Outcome::default();

    for (step, op) in ops.iter().enumerate() {
        match control::apply(cp, op).await {
            Ok(handle) => match (op, handle) {
                (Op::Add { chain, .. }, Some(handle)) => {
                    outcome.added.push(AddedRule {
                        chain: chain.clone(),
                        handle,
                    });
                    applied.push(Applied::Added {
                        chain: chain.clone(),
                        handle,
                    });
                }
                (Op::Delete { rule }, _) => applied.push(Applied::Deleted { rule: rule.clone() }),
                (Op::Add { .. }, None) => {
                    unwind(cp, &applied).await;
                    return Err(Error::Internal(format!("add returned no handle: {op}")));
                }
            },
            Err(e) => {
                error!("Step {}/{} failed ({op}): {e}", step + 1, ops.len());
                unwind(cp, &applied).await;
                return Err(e);
            }
        }
    }

    Ok(outcome)
}

/// Deletes every rule a committed transaction added, for callers whose follow-up
/// step outside the firewall failed.
pub async fn undo<C: ControlPlane>(cp: &C, outcome: &Outcome) {
    let applied: Vec<Applied> = outcome
        .added
        .iter()
        .map(|r| Applied::Added {
            chain: r.chain.clone(),
            handle: r.handle,
        })
        .collect();
    unwind(cp, &applied).await;
}

async fn unwind<C: ControlPlane>(cp: &C, applied: &[Applied]) {
    for step in applied.iter().rev() {
        let inverse = step.inverse();
        if let Err(e) = control::apply(cp, &inverse).await {
            warn!("Rollback step failed ({inverse}): {e}");
        }
    }
}
