//! Coalescing of ready operations into as few CRM calls as possible.

use crate::crm::{AssociationRequest, RecordUpdate};
use crate::executor::Operation;
use crate::types::{RecordId, RecordType};
use std::collections::HashMap;

/// One CRM call and the plan steps it settles.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub seqs: Vec<u32>,
    pub operation: Operation,
}

enum Slot {
    Create(u32, Operation),
    Associate {
        seqs: Vec<u32>,
        request: AssociationRequest,
    },
    Update {
        seqs: Vec<u32>,
        record_type: RecordType,
        updates: Vec<RecordUpdate>,
    },
}

/// Merge ready operations.
///
/// Associations sharing a primary record and category become one request with
/// de-duplicated inputs. Updates of one record type are packed into batches of
/// at most `max_batch_size`, never with the same record twice in a batch.
/// Creates pass through one call each. Output keeps first-seen order.
pub fn coalesce(items: Vec<(u32, Operation)>, max_batch_size: usize) -> Vec<Dispatch> {
    let max_batch_size = max_batch_size.max(1);
    let mut slots: Vec<Slot> = Vec::new();
    let mut assoc_index: HashMap<(RecordType, RecordId, String), usize> = HashMap::new();
    let mut update_index: HashMap<RecordType, Vec<usize>> = HashMap::new();

    for (seq, operation) in items {
        match operation {
            Operation::Create { .. } => slots.push(Slot::Create(seq, operation)),
            Operation::Associate(request) => {
                let key = (
                    request.from_type,
                    request.from_id.clone(),
                    request.category.clone(),
                );
                match assoc_index.get(&key) {
                    Some(&i) => {
                        if let Slot::Associate {
                            seqs,
                            request: merged,
                        } = &mut slots[i]
                        {
                            seqs.push(seq);
                            for input in request.inputs {
                                if !merged.inputs.contains(&input) {
                                    merged.inputs.push(input);
                                }
                            }
                        }
                    }
                    None => {
                        assoc_index.insert(key, slots.len());
                        slots.push(Slot::Associate {
                            seqs: vec![seq],
                            request,
                        });
                    }
                }
            }
            Operation::Update {
                record_type,
                updates,
            } => {
                let candidates = update_index.entry(record_type).or_default();
                let target = candidates.iter().copied().find(|&i| match &slots[i] {
                    Slot::Update { updates: batch, .. } => {
                        batch.len() + updates.len() <= max_batch_size
                            && !updates
                                .iter()
                                .any(|u| batch.iter().any(|b| b.id == u.id))
                    }
                    _ => false,
                });
                match target {
                    Some(i) => {
                        if let Slot::Update {
                            seqs,
                            updates: batch,
                            ..
                        } = &mut slots[i]
                        {
                            seqs.push(seq);
                            batch.extend(updates);
                        }
                    }
                    None => {
                        candidates.push(slots.len());
                        slots.push(Slot::Update {
                            seqs: vec![seq],
                            record_type,
                            updates,
                        });
                    }
                }
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Create(seq, operation) => Dispatch {
                seqs: vec![seq],
                operation,
            },
            Slot::Associate { seqs, request } => Dispatch {
                seqs,
                operation: Operation::Associate(request),
            },
            Slot::Update {
                seqs,
                record_type,
                updates,
            } => Dispatch {
                seqs,
                operation: Operation::Update {
                    record_type,
                    updates,
                },
            },
        })
        .collect()
}
