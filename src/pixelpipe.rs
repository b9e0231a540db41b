use glam::{IVec2, Vec3, Vec4};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::buffers::TriangleRecord;
use crate::error::{RasterError, RasterResult};

/// How a shaded sample is combined with the destination color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Replace,
    SrcOver,
}

impl BlendOp {
    pub fn apply(self, src: Vec4, dst: Vec4) -> Vec4 {
        match self {
            BlendOp::Replace => src,
            BlendOp::SrcOver => {
                let inv = 1.0 - src.w;
                Vec4::new(
                    src.x * src.w + dst.x * inv,
                    src.y * src.w + dst.y * inv,
                    src.z * src.w + dst.z * inv,
                    src.w + dst.w * inv,
                )
            }
        }
    }
}

/// Capability key a pipe is compiled against. Resolution happens once per
/// (name, spec) pair; draw calls reuse the cached callable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeSpec {
    pub samples_log2: i32,
    pub depth_test: bool,
}

/// One covered sample handed to a pixel pipe.
pub struct Fragment<'a> {
    pub record: &'a TriangleRecord,
    /// Barycentric weights over the canonical vertex order.
    pub bary: Vec3,
    pub pixel: IVec2,
    pub sample: i32,
}

/// Compiled shading/blend configuration invoked per covered sample. Depth
/// testing itself runs in the fine rasterizer; `depth_test` only reports
/// whether this pipe wants it.
pub trait PixelPipe: Send + Sync {
    fn shade(&self, frag: &Fragment<'_>) -> Vec4;
    fn blend(&self) -> BlendOp;
    fn depth_test(&self) -> bool;
}

/// Interpolates vertex colors; the reference pipe of the pipeline.
pub struct GouraudPipe {
    blend: BlendOp,
    depth_test: bool,
}

impl GouraudPipe {
    pub fn new(blend: BlendOp, spec: &PipeSpec) -> Self {
        Self {
            blend,
            depth_test: spec.depth_test,
        }
    }
}

impl PixelPipe for GouraudPipe {
    fn shade(&self, frag: &Fragment<'_>) -> Vec4 {
        let c = &frag.record.color;
        c[0] * frag.bary.x + c[1] * frag.bary.y + c[2] * frag.bary.z
    }

    fn blend(&self) -> BlendOp {
        self.blend
    }

    fn depth_test(&self) -> bool {
        self.depth_test
    }
}

type PipeFactory = Box<dyn Fn(&PipeSpec) -> Arc<dyn PixelPipe> + Send + Sync>;

/// Registry of named pipe factories plus a resolve-once cache keyed by the
/// capability spec. Looking up an unregistered name is a setup-time fatal
/// error, never a draw-time one.
pub struct PipeModule {
    factories: HashMap<String, PipeFactory>,
    cache: Mutex<HashMap<(String, PipeSpec), Arc<dyn PixelPipe>>>,
}

impl PipeModule {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the built-in Gouraud pipes.
    pub fn with_builtins() -> Self {
        let mut module = Self::new();
        module.register("gouraud_replace", |spec| {
            Arc::new(GouraudPipe::new(BlendOp::Replace, spec))
        });
        module.register("gouraud_srcover", |spec| {
            Arc::new(GouraudPipe::new(BlendOp::SrcOver, spec))
        });
        module
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&PipeSpec) -> Arc<dyn PixelPipe> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn resolve(&self, name: &str, spec: &PipeSpec) -> RasterResult<Arc<dyn PixelPipe>> {
        let key = (name.to_string(), spec.clone());
        if let Ok(cache) = self.cache.lock() {
            if let Some(pipe) = cache.get(&key) {
                return Ok(pipe.clone());
            }
        }
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RasterError::UnknownPixelPipe(name.to_string()))?;
        let pipe = factory(spec);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, pipe.clone());
        }
        Ok(pipe)
    }
}

impl Default for PipeModule {
    fn default() -> Self {
        Self::with_builtins()
    }
}
