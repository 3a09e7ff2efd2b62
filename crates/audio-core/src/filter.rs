//! Audio filter chain
//!
//! Filters are registered once in a [`FilterRegistry`]; each pipeline builds
//! its own [`FilterChain`] from it when devices start. The encode side runs
//! in registration order, the decode side in reverse.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;

/// Parameters for one direction of a filter instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterParams {
    /// Sample rate of the PCM entering the filter
    pub srate: u32,
    /// Sample rate of the PCM leaving the filter
    pub srate_out: u32,
    /// Channel count
    pub channels: u8,
    /// Samples per frame
    pub frame_size: usize,
    /// Echo canceller tail length in milliseconds
    pub aec_len: u32,
}

/// Per-pipeline filter state
pub trait FilterState: Send {
    /// Process captured PCM before encoding
    fn encode(&mut self, _pcm: &mut Vec<i16>) -> Result<()> {
        Ok(())
    }

    /// Process decoded PCM before playout
    fn decode(&mut self, _pcm: &mut Vec<i16>) -> Result<()> {
        Ok(())
    }

    /// Loudspeaker mode changed
    fn update(&mut self, _speakerphone: bool) -> Result<()> {
        Ok(())
    }
}

/// A registered filter
pub trait AudioFilter: Send + Sync {
    /// Filter name, used in logs
    fn name(&self) -> &str;

    /// Create filter state for one pipeline
    fn alloc(&self, enc: &FilterParams, dec: &FilterParams) -> Result<Box<dyn FilterState>>;
}

/// Ordered set of available filters
#[derive(Default, Clone)]
pub struct FilterRegistry {
    filters: Vec<Arc<dyn AudioFilter>>,
}

impl FilterRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter
    pub fn register(&mut self, filter: Arc<dyn AudioFilter>) {
        debug!("aufilt: registered {}", filter.name());
        self.filters.push(filter);
    }

    /// Number of registered filters
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filters in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AudioFilter>> {
        self.filters.iter()
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.filters.iter().map(|flt| flt.name()))
            .finish()
    }
}

/// Instantiated filters of one pipeline
pub struct FilterChain {
    states: Vec<(String, Box<dyn FilterState>)>,
}

impl FilterChain {
    /// Instantiate every registered filter; any failure aborts the chain
    pub fn alloc(registry: &FilterRegistry, enc: &FilterParams, dec: &FilterParams) -> Result<Self> {
        let mut states = Vec::with_capacity(registry.len());
        for filter in registry.iter() {
            let state = filter.alloc(enc, dec)?;
            debug!(
                "aufilt: {} enc={}Hz dec={}Hz",
                filter.name(),
                enc.srate,
                dec.srate_out
            );
            states.push((filter.name().to_string(), state));
        }
        Ok(Self { states })
    }

    /// Run captured PCM through every filter in order
    pub fn encode(&mut self, pcm: &mut Vec<i16>) -> Result<()> {
        for (_, state) in self.states.iter_mut() {
            state.encode(pcm)?;
        }
        Ok(())
    }

    /// Run decoded PCM through every filter in reverse order
    pub fn decode(&mut self, pcm: &mut Vec<i16>) -> Result<()> {
        for (_, state) in self.states.iter_mut().rev() {
            state.decode(pcm)?;
        }
        Ok(())
    }

    /// Notify every filter of a loudspeaker mode change
    pub fn update(&mut self, speakerphone: bool) -> Result<()> {
        for (_, state) in self.states.iter_mut() {
            state.update(speakerphone)?;
        }
        Ok(())
    }

    /// Filter names in encode order
    pub fn names(&self) -> Vec<&str> {
        self.states.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Number of filters in the chain
    pub fn len(&self) -> usize {
        self.states.len()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Tagger {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct TaggerState {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl AudioFilter for Tagger {
        fn name(&self) -> &str {
            self.name
        }

        fn alloc(&self, enc: &FilterParams, _dec: &FilterParams) -> Result<Box<dyn FilterState>> {
            if enc.srate == 0 {
                return Err(crate::error::AudioError::filter(self.name, "no encoder"));
            }
            Ok(Box::new(TaggerState {
                name: self.name,
                log: Arc::clone(&self.log),
            }))
        }
    }

    impl FilterState for TaggerState {
        fn encode(&mut self, _pcm: &mut Vec<i16>) -> Result<()> {
            self.log.lock().push(format!("enc:{}", self.name));
            Ok(())
        }

        fn decode(&mut self, _pcm: &mut Vec<i16>) -> Result<()> {
            self.log.lock().push(format!("dec:{}", self.name));
            Ok(())
        }
    }

    fn registry(log: &Arc<Mutex<Vec<String>>>) -> FilterRegistry {
        let mut registry = FilterRegistry::new();
        for name in ["a", "b"] {
            registry.register(Arc::new(Tagger {
                name,
                log: Arc::clone(log),
            }));
        }
        registry
    }

    #[test]
    fn test_chain_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let prm = FilterParams {
            srate: 8000,
            srate_out: 8000,
            channels: 1,
            frame_size: 160,
            aec_len: 0,
        };
        let mut chain = FilterChain::alloc(&registry(&log), &prm, &prm).unwrap();
        assert_eq!(chain.names(), vec!["a", "b"]);

        let mut pcm = vec![0i16; 160];
        chain.encode(&mut pcm).unwrap();
        chain.decode(&mut pcm).unwrap();
        chain.update(true).unwrap();
        assert_eq!(*log.lock(), vec!["enc:a", "enc:b", "dec:b", "dec:a"]);
    }

    #[test]
    fn test_alloc_failure_aborts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = FilterChain::alloc(&registry(&log), &FilterParams::default(), &FilterParams::default());
        assert!(err.is_err());
    }
}
