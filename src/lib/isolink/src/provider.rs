//! Symbol providers and the ordered chains built from them.

use std::sync::Arc;

/// Location of a thread-local symbol: the defining module's TLS handle and the
/// symbol's offset within that module's per-thread block. The two words match
/// the platform `tls_index` convention, so a descriptor can be written
/// directly into DTPMOD64/DTPOFF64 relocation slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsDescriptor {
    pub module: usize,
    pub offset: usize,
}

/// The capability to resolve a symbol name to something usable.
///
/// A lookup miss is a normal empty result, never an error; chain resolution
/// uses misses to continue probing. Implementations must tolerate concurrent
/// calls from loading and running threads.
pub trait SymbolProvider: Send + Sync {
    /// Resolve a name to an absolute address.
    fn resolve(&self, name: &str) -> Option<usize>;

    /// Resolve a name to a thread-local storage location.
    fn resolve_tls(&self, name: &str) -> Option<TlsDescriptor>;
}

/// An ordered list of providers, probed front to back. The chain backing a
/// library is fixed once its load begins.
#[derive(Default)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn SymbolProvider>>,
}

impl ProviderChain {
    pub(crate) fn push(&mut self, provider: Arc<dyn SymbolProvider>) {
        self.providers.push(provider);
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Probe the chain in order; the first hit wins.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.providers.iter().find_map(|p| p.resolve(name))
    }

    pub fn resolve_tls(&self, name: &str) -> Option<TlsDescriptor> {
        self.providers.iter().find_map(|p| p.resolve_tls(name))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct FixedProvider(HashMap<&'static str, usize>);

    impl SymbolProvider for FixedProvider {
        fn resolve(&self, name: &str) -> Option<usize> {
            self.0.get(name).copied()
        }

        fn resolve_tls(&self, _name: &str) -> Option<TlsDescriptor> {
            None
        }
    }

    #[test]
    fn first_match_wins() {
        let p1 = Arc::new(FixedProvider(HashMap::from([("foo", 0x1000), ("bar", 0x1008)])));
        let p2 = Arc::new(FixedProvider(HashMap::from([("foo", 0x2000), ("baz", 0x2008)])));

        let mut chain = ProviderChain::default();
        chain.push(p1);
        chain.push(p2);

        assert_eq!(chain.resolve("foo"), Some(0x1000));
        assert_eq!(chain.resolve("bar"), Some(0x1008));
        assert_eq!(chain.resolve("baz"), Some(0x2008));
        assert_eq!(chain.resolve("missing"), None);
    }

    #[test]
    fn empty_chain_misses() {
        let chain = ProviderChain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.resolve("anything"), None);
        assert_eq!(chain.resolve_tls("anything"), None);
    }
}
