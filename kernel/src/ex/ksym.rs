//! Kernel symbol table.
//!
//! Driver images are relocatable objects; their undefined symbols resolve
//! against this registry. The boot code registers the exported kernel
//! entry points before the first driver loads.

use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::ke::SpinLock;
use crate::status::{Result, Status};

static SYMBOLS: SpinLock<BTreeMap<String, usize>> = SpinLock::new(BTreeMap::new());

pub fn register(name: &str, address: usize) {
    SYMBOLS.lock().insert(String::from(name), address);
}

pub fn resolve(name: &str) -> Result<usize> {
    SYMBOLS
        .lock()
        .get(name)
        .copied()
        .ok_or(Status::UnresolvedSymbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_symbols_resolve() {
        register("IoCreateRp", 0xD123_4567);
        assert_eq!(resolve("IoCreateRp"), Ok(0xD123_4567));
        assert_eq!(resolve("NoSuchSymbol"), Err(Status::UnresolvedSymbol));
    }
}
