//! Interpreter for transaction code. Commands read and write only the key
//! sets declared by the transaction; touching an undeclared key is a no-op,
//! which keeps replayed executions identical on every machine.

use std::collections::HashMap;

use crate::txn::{Transaction, TransactionStatus};

/// Seam between the worker and the procedure bodies it runs.
pub trait Commands: Send {
    fn execute(&mut self, txn: &mut Transaction);
}

/// The built-in key-value command language:
/// `GET k`, `SET k v`, `DEL k`, `COPY src dst`, `ABORT k`.
#[derive(Default)]
pub struct KeyValueCommands;

fn command_num_args(cmd: &str) -> Option<usize> {
    // GET is a no-op at execution time: declared reads were already
    // populated from storage and remote partitions.
    static TABLE: &[(&str, usize)] = &[
        ("GET", 1),
        ("SET", 2),
        ("DEL", 1),
        ("COPY", 2),
        ("ABORT", 1),
    ];
    TABLE
        .iter()
        .find(|(name, _)| *name == cmd)
        .map(|(_, n)| *n)
}

impl KeyValueCommands {
    pub fn new() -> Self {
        Self
    }
}

impl Commands for KeyValueCommands {
    fn execute(&mut self, txn: &mut Transaction) {
        let code = match &txn.procedure {
            crate::txn::Procedure::Code(code) => code.clone(),
            crate::txn::Procedure::Remaster { .. } => {
                // Remasters carry no code; the worker commits them directly.
                txn.status = TransactionStatus::Committed;
                return;
            }
        };

        let mut staged_writes: HashMap<String, String> = HashMap::new();
        let mut staged_deletes: Vec<String> = Vec::new();
        let mut abort_reason: Option<String> = None;

        let mut tokens = code.split_whitespace();
        'parse: while let Some(cmd) = tokens.next() {
            let Some(num_args) = command_num_args(cmd) else {
                abort_reason = Some(format!("invalid command: {cmd}"));
                break;
            };
            let mut args = Vec::with_capacity(num_args);
            for _ in 0..num_args {
                match tokens.next() {
                    Some(arg) => args.push(arg.to_string()),
                    None => {
                        abort_reason =
                            Some(format!("invalid number of arguments for command {cmd}"));
                        break 'parse;
                    }
                }
            }
            match cmd {
                "SET" => {
                    if txn.write_set.contains_key(&args[0]) {
                        let value = std::mem::take(&mut args[1]);
                        staged_writes.insert(std::mem::take(&mut args[0]), value);
                    }
                }
                "DEL" => {
                    if txn.write_set.contains_key(&args[0]) {
                        staged_deletes.push(std::mem::take(&mut args[0]));
                    }
                }
                "COPY" => {
                    let (src, dst) = (&args[0], &args[1]);
                    if txn.write_set.contains_key(dst) {
                        if let Some(value) = txn.read_set.get(src) {
                            staged_writes.insert(dst.clone(), value.clone());
                        }
                    }
                }
                "ABORT" => {
                    abort_reason = Some(format!("user abort (key: {})", args[0]));
                    break;
                }
                _ => {}
            }
        }

        if let Some(reason) = abort_reason {
            txn.abort(reason);
            return;
        }
        for (key, value) in staged_writes {
            txn.write_set.insert(key, value);
        }
        for key in staged_deletes {
            if !txn.delete_set.contains(&key) {
                txn.delete_set.push(key);
            }
        }
        txn.status = TransactionStatus::Committed;
    }
}
