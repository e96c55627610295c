#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use recipe_shared::capabilities::{
    ConnectivityProbe, GenerationFailure, ImagePipeline, ImagePipelineError, KeyValueStore,
    MemoryKvStore, ProbeError, ProbeResult, RecipeGenerator,
};
use recipe_shared::CoreCapabilities;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct SwitchProbe {
    online: AtomicBool,
}

impl SwitchProbe {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(online),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for SwitchProbe {
    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(ProbeResult::online())
        } else {
            Ok(ProbeResult::offline())
        }
    }
}

#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<Value, GenerationFailure>>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, response: Result<Value, GenerationFailure>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecipeGenerator for ScriptedGenerator {
    async fn generate(&self, _ingredients: &[String]) -> Result<Value, GenerationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationFailure::Other("no scripted response".into())))
    }
}

#[derive(Default)]
pub struct RecordingPipeline {
    pub prefetched: Mutex<Vec<String>>,
    pub disk_evictions: AtomicUsize,
    pub memory_evictions: AtomicUsize,
}

impl RecordingPipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ImagePipeline for RecordingPipeline {
    async fn load(&self, _uri: &str) -> Result<Bytes, ImagePipelineError> {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.resize(64, 0);
        Ok(Bytes::from(png))
    }

    async fn prefetch(&self, uris: &[String]) -> Result<(), ImagePipelineError> {
        self.prefetched.lock().unwrap().extend_from_slice(uris);
        Ok(())
    }

    async fn evict_disk(&self) -> Result<(), ImagePipelineError> {
        self.disk_evictions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn evict_memory(&self) -> Result<(), ImagePipelineError> {
        self.memory_evictions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub kv: Arc<dyn KeyValueStore>,
    pub probe: Arc<SwitchProbe>,
    pub generator: Arc<ScriptedGenerator>,
    pub pipeline: Arc<RecordingPipeline>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryKvStore::new()))
    }

    pub fn with_store(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            probe: SwitchProbe::new(true),
            generator: ScriptedGenerator::new(),
            pipeline: RecordingPipeline::new(),
        }
    }

    pub fn capabilities(&self) -> CoreCapabilities {
        CoreCapabilities {
            kv: Arc::clone(&self.kv),
            probe: self.probe.clone(),
            images: self.pipeline.clone(),
            generator: self.generator.clone(),
        }
    }
}

pub fn recipe_payload(title: &str) -> Value {
    json!({
        "title": title,
        "description": "Test recipe",
        "servings": 2,
        "ingredients": ["tomato", "basil"],
        "steps": [
            {"instruction": "Chop", "imageUrl": format!("https://img.test/{title}/step1.png")},
            {"instruction": "Simmer"}
        ],
        "heroImage": format!("https://img.test/{title}/hero.png")
    })
}

pub fn ingredients(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}
