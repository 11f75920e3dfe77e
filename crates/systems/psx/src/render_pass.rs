//! Lazily created render pass objects, one per attachment configuration.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentFormat {
    Rgba8,
    Depth16,
    Depth32F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color_format: AttachmentFormat,
    pub depth_format: Option<AttachmentFormat>,
    pub samples: u32,
    pub load_op: LoadOp,
}

impl RenderPassKey {
    pub fn color(format: AttachmentFormat, load_op: LoadOp) -> Self {
        Self {
            color_format: format,
            depth_format: None,
            samples: 1,
            load_op,
        }
    }
}

/// Passes live as long as the cache (i.e. the owning context)
pub struct RenderPassCache<P> {
    passes: HashMap<RenderPassKey, P>,
}

impl<P> Default for RenderPassCache<P> {
    fn default() -> Self {
        Self { passes: HashMap::new() }
    }
}

impl<P: Clone> RenderPassCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<E>(
        &mut self,
        key: RenderPassKey,
        create: impl FnOnce(&RenderPassKey) -> Result<P, E>,
    ) -> Result<P, E> {
        if let Some(pass) = self.passes.get(&key) {
            return Ok(pass.clone());
        }
        let pass = create(&key)?;
        self.passes.insert(key, pass.clone());
        Ok(pass)
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Drop every pass through `destroy`
    pub fn clear(&mut self, mut destroy: impl FnMut(P)) {
        for (_, pass) in self.passes.drain() {
            destroy(pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_once_per_key() {
        let mut cache: RenderPassCache<u32> = RenderPassCache::new();
        let mut created = 0;
        let key = RenderPassKey {
            color_format: AttachmentFormat::Rgba8,
            depth_format: Some(AttachmentFormat::Depth16),
            samples: 4,
            load_op: LoadOp::Load,
        };

        for _ in 0..3 {
            let pass = cache
                .get_or_create(key, |_| {
                    created += 1;
                    Ok::<u32, ()>(created)
                })
                .expect("create");
            assert_eq!(pass, 1);
        }
        assert_eq!(created, 1);

        let other = RenderPassKey { load_op: LoadOp::Clear, ..key };
        cache.get_or_create(other, |_| Ok::<u32, ()>(9)).expect("create");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_creation_is_not_cached() {
        let mut cache: RenderPassCache<u32> = RenderPassCache::new();
        let key = RenderPassKey::color(AttachmentFormat::Rgba8, LoadOp::DontCare);
        assert!(cache.get_or_create(key, |_| Err("no memory")).is_err());
        assert!(cache.is_empty());

        let mut destroyed = Vec::new();
        cache.get_or_create(key, |_| Ok::<u32, ()>(5)).expect("create");
        cache.clear(|p| destroyed.push(p));
        assert_eq!(destroyed, vec![5]);
        assert!(cache.is_empty());
    }
}
