//! C1 — IR Verifier Shim (spec §4.2). A thin, side-effect-free wrapper around the host IR
//! toolkit's verifier: distinguishes function-scoped from module-scoped checks, logs the pass
//! name and location on failure, and never panics or mutates.

use codedefender_ir::{verify_function, verify_module, Function, Module};

/// Re-verifies a single function after a function-scoped pass. Returns `true` if well-formed.
/// On failure, logs the pass name and function name; never unwinds (spec §7: transform-local
/// invariant violations are logged and the engine proceeds to the next pass).
pub fn check_function(f: &Function, pass_name: &str) -> bool {
    match verify_function(f) {
        Ok(()) => true,
        Err(e) => {
            log::warn!(
                "verification failed after pass `{pass_name}` in function `{}`: {e}",
                f.name
            );
            false
        }
    }
}

/// Re-verifies the whole module after a module-scoped pass.
pub fn check_module(module: &Module, pass_name: &str) -> bool {
    match verify_module(module) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("verification failed after pass `{pass_name}`: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedefender_ir::block::Terminator;
    use codedefender_ir::types::Type;

    #[test]
    fn well_formed_function_passes() {
        let mut f = Function::new("f", Type::Void, vec![]);
        let e = f.push_block("entry");
        f.block_mut(e).terminator = Terminator::Ret { value: None };
        assert!(check_function(&f, "test"));
    }

    #[test]
    fn function_with_no_blocks_fails() {
        let f = Function::new("f", Type::Void, vec![]);
        assert!(!check_function(&f, "test"));
    }
}
