use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    cache::InternCache,
    layout::{BlockedEncoding, Encoding, Layout, LayoutError, ParseError},
    verify::{DotVerifier, LayoutVerifier},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId;

/// Target parameters the convenience builders of a [`Context`] fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ContextConfig {
    pub threads_per_warp: u32,
    pub num_warps: u32,
    pub num_ctas: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            threads_per_warp: 32,
            num_warps: 4,
            num_ctas: 1,
        }
    }
}

impl ContextConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug)]
pub struct ContextInternal {
    pub id: uid::Id<ContextId>,
    pub config: ContextConfig,

    layouts: InternCache<Encoding>,
    verifiers: RwLock<HashMap<String, Arc<dyn LayoutVerifier>>>,
}

/// Owns every layout built during one compilation.
///
/// Cloning is cheap and yields a handle to the same intern table.
#[derive(Debug, Clone)]
pub struct Context(Arc<ContextInternal>);

impl std::ops::Deref for Context {
    type Target = ContextInternal;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if Arc::strong_count(&self.0) <= 1 {
            log::debug!(
                "context {:?} released with {} layouts",
                self.id,
                self.layouts.len()
            );
        }
    }
}

pub struct ContextBuilder {
    pub config: ContextConfig,
    pub verifiers: Vec<(String, Arc<dyn LayoutVerifier>)>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        let dot: Arc<dyn LayoutVerifier> = Arc::new(DotVerifier);
        Self {
            config: Default::default(),
            verifiers: vec![("dot".into(), dot)],
        }
    }

    pub fn build(self) -> Context {
        let Self { config, verifiers } = self;
        let id = uid::Id::new();
        log::info!("context {id:?} created with {config:?}");

        let verifiers = verifiers.into_iter().collect();
        Context(Arc::new(ContextInternal {
            id,
            config,
            layouts: InternCache::new(),
            verifiers: RwLock::new(verifiers),
        }))
    }

    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_threads_per_warp(mut self, threads_per_warp: u32) -> Self {
        self.config.threads_per_warp = threads_per_warp;
        self
    }

    pub fn with_num_warps(mut self, num_warps: u32) -> Self {
        self.config.num_warps = num_warps;
        self
    }

    pub fn with_num_ctas(mut self, num_ctas: u32) -> Self {
        self.config.num_ctas = num_ctas;
        self
    }

    /// Registers `verifier` for operations named `name`, replacing any earlier one.
    pub fn with_verifier(
        mut self,
        name: impl Into<String>,
        verifier: impl LayoutVerifier + 'static,
    ) -> Self {
        let name = name.into();
        let verifier: Arc<dyn LayoutVerifier> = Arc::new(verifier);
        self.verifiers.retain(|(key, _)| *key != name);
        self.verifiers.push((name, verifier));
        self
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Context {}

impl Context {
    /// Validates `encoding` and returns its unique interned handle.
    pub fn get(&self, encoding: impl Into<Encoding>) -> Result<Layout, LayoutError> {
        let encoding = encoding.into();
        encoding.validate()?;
        Ok(Layout::from_interned(self.layouts.checkout(encoding)))
    }

    /// Parses the textual form of a layout and interns it.
    pub fn parse_layout(&self, text: &str) -> Result<Layout, ParseError> {
        crate::layout::text::parse(self, text)
    }

    /// Number of distinct layouts interned so far.
    pub fn num_layouts(&self) -> usize {
        self.layouts.len()
    }

    pub fn register_verifier(&self, name: impl Into<String>, verifier: Arc<dyn LayoutVerifier>) {
        let mut verifiers = self.verifiers.write().unwrap_or_else(PoisonError::into_inner);
        verifiers.insert(name.into(), verifier);
    }

    pub fn verifier(&self, name: &str) -> Option<Arc<dyn LayoutVerifier>> {
        let verifiers = self.verifiers.read().unwrap_or_else(PoisonError::into_inner);
        verifiers.get(name).cloned()
    }

    /// A blocked layout for `shape` spread over the warps and CTAs of the configured target.
    pub fn blocked(
        &self,
        shape: &[i64],
        size_per_thread: &[u32],
        order: &[u32],
    ) -> Result<Layout, LayoutError> {
        let ContextConfig {
            threads_per_warp,
            num_warps,
            num_ctas,
        } = self.config;
        let layout = BlockedEncoding::from_shape_with_ctas(
            shape,
            size_per_thread,
            order,
            num_warps,
            threads_per_warp,
            num_ctas,
        )?;
        self.get(layout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use super::{ContextBuilder, ContextConfig};
    use crate::{
        layout::{CtaLayout, Layout, SharedEncoding},
        verify::{LayoutVerifier, Operation, VerifyError},
    };

    #[test]
    fn test_config() -> Result<()> {
        let config = ContextConfig::from_json(r#"{"num_warps": 8}"#)?;
        assert_eq!(
            config,
            ContextConfig {
                threads_per_warp: 32,
                num_warps: 8,
                num_ctas: 1
            }
        );
        assert!(ContextConfig::from_json(r#"{"num_warps": "eight"}"#).is_err());

        let context = ContextBuilder::new()
            .with_config(config)
            .with_threads_per_warp(64)
            .with_num_ctas(2)
            .build();
        assert_eq!(context.config.threads_per_warp, 64);
        assert_eq!(context.config.num_warps, 8);
        assert_eq!(context.config.num_ctas, 2);
        Ok(())
    }

    #[test]
    fn test_intern() -> Result<()> {
        let context = ContextBuilder::new().build();
        let build = || SharedEncoding::new(8, 1, 8, vec![1, 0], CtaLayout::default_for(2));
        let a = context.get(build()?)?;
        let b = context.clone().get(build()?)?;
        assert!(a.ptr_eq(&b));
        assert_eq!(context.num_layouts(), 1);

        let c = context.get(SharedEncoding::new(4, 1, 8, vec![1, 0], CtaLayout::default_for(2))?)?;
        assert_ne!(a, c);
        assert_eq!(context.num_layouts(), 2);
        Ok(())
    }

    #[test]
    fn test_intern_across_threads() -> Result<()> {
        let context = ContextBuilder::new().build();
        let handles = (0..4)
            .map(|_| {
                let context = context.clone();
                std::thread::spawn(move || {
                    (1..=8)
                        .map(|vec| {
                            let layout = SharedEncoding::new(vec, 1, 1, vec![0], CtaLayout::default_for(1))?;
                            context.get(layout)
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
            })
            .collect::<Vec<_>>();

        let mut results = vec![];
        for handle in handles {
            let layouts = handle.join().map_err(|_| anyhow::anyhow!("thread panicked"))??;
            results.push(layouts);
        }
        for layouts in &results[1..] {
            assert!(layouts.iter().zip(&results[0]).all(|(x, y)| x.ptr_eq(y)));
        }
        assert_eq!(context.num_layouts(), 8);
        Ok(())
    }

    #[test]
    fn test_blocked_from_config() -> Result<()> {
        let context = ContextBuilder::new().with_num_warps(8).with_num_ctas(2).build();
        let layout = context.blocked(&[256, 64], &[1, 4], &[1, 0])?;
        assert_eq!(layout.num_warps()?, 8);
        assert_eq!(layout.num_ctas()?, 2);
        assert_eq!(layout.threads_per_warp()?.iter().product::<u32>(), 32);
        Ok(())
    }

    #[derive(Debug)]
    struct RejectAll;

    impl LayoutVerifier for RejectAll {
        fn verify(&self, op: &dyn Operation, operand: usize, _layout: &Layout) -> Result<(), VerifyError> {
            Err(VerifyError::new(op, operand, "rejected"))
        }
    }

    #[test]
    fn test_verifier_registry() {
        let context = ContextBuilder::new().with_verifier("load", RejectAll).build();
        assert!(context.verifier("dot").is_some());
        assert!(context.verifier("load").is_some());
        assert!(context.verifier("store").is_none());

        context.register_verifier("store", Arc::new(RejectAll));
        assert!(context.verifier("store").is_some());
    }
}
