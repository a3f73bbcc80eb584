//! Generation orchestrator: drives the engine over a [`ScriptPlan`].
//!
//! Both modes walk the plan in index order.  Pauses never reach the engine:
//! they become silence at the engine's sample rate.  Before every speech
//! chunk a fresh RNG is derived from the request seed and the chunk's plan
//! index, so a chunk's audio depends only on (text, voices, seed, config)
//! and not on what was generated before it.
//!
//! * **Batch**: [`generate_batch`] runs inline and returns the whole buffer
//!   or the first error; nothing partial escapes.
//! * **Streaming**: [`stream`] moves the [`EngineLease`] onto a blocking
//!   worker that pushes each finished unit into an [`AudioStream`].  The last
//!   speech chunk is decoded incrementally when the engine supports it.
//!   Chunks already delivered stay delivered when a later chunk fails.

use std::ops::ControlFlow;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::audio::{silence, Assembler, AudioBuffer};
use crate::chunker::{PlanItem, ScriptPlan};
use crate::engine::{EngineInput, GenerationParams, SpeechEngine, VoiceSample};
use crate::error::{Error, Result};
use crate::lifecycle::EngineLease;
use crate::stream::{AudioStream, ChunkKind, ChunkSender, StreamOptions};

/// Everything needed to render one script.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub plan: ScriptPlan,
    pub voices: Vec<VoiceSample>,
    pub params: GenerationParams,
    pub seed: u64,
}

impl GenerationRequest {
    fn input<'a>(&'a self, text: &'a str) -> EngineInput<'a> {
        EngineInput { text, voices: &self.voices, params: &self.params }
    }
}

/// RNG for the chunk at `plan_index`.
pub fn chunk_rng(seed: u64, plan_index: usize) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(plan_index as u64))
}

/// Pick a seed for a request that did not supply one.
pub fn draw_seed() -> u64 {
    let seed = rand::random::<u32>() as u64;
    info!(seed, "no seed supplied, using a random one");
    seed
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch
// ─────────────────────────────────────────────────────────────────────────────

/// Render the whole plan on the calling thread.
pub fn generate_batch(engine: &mut dyn SpeechEngine, request: &GenerationRequest) -> Result<AudioBuffer> {
    let rate = engine.sample_rate();
    let mut asm = Assembler::new(rate);

    for item in request.plan.items() {
        match item {
            PlanItem::Pause { duration_ms, .. } => asm.push_silence(*duration_ms),
            PlanItem::Speech(chunk) => {
                let mut rng = chunk_rng(request.seed, chunk.index);
                let wave = engine
                    .generate(&request.input(&chunk.text), &mut rng)
                    .map_err(|e| Error::generation(chunk.index, e))?;
                debug!(chunk = chunk.index, words = chunk.word_count, samples = wave.len(), "chunk generated");
                asm.push_chunk(&wave, rate)
                    .map_err(|e| Error::generation(chunk.index, e))?;
            }
        }
    }

    let buffer = asm.finish();
    info!(
        items = request.plan.len(),
        seconds = buffer.duration_secs(),
        "batch generation complete"
    );
    Ok(buffer)
}

/// Run [`generate_batch`] on a blocking worker while the caller awaits it.
pub async fn run_batch(mut lease: EngineLease, request: GenerationRequest) -> Result<AudioBuffer> {
    tokio::task::spawn_blocking(move || generate_batch(lease.engine_mut(), &request))
        .await
        .map_err(|e| Error::Generation { chunk: 0, message: format!("generation task failed: {e}") })?
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Start streaming generation.  The lease is held by the worker until it
/// finishes or notices cancellation.
pub fn stream(
    lease: EngineLease,
    request: GenerationRequest,
    options: StreamOptions,
    reload_flag: Arc<AtomicBool>,
) -> AudioStream {
    let rate = lease.sample_rate();
    AudioStream::spawn(options, rate, reload_flag, move |tx| produce(lease, request, tx))
}

fn produce(mut lease: EngineLease, request: GenerationRequest, mut tx: ChunkSender) {
    let engine = lease.engine_mut();
    let rate = engine.sample_rate();
    let last_speech = request.plan.last_speech_index();

    for item in request.plan.items() {
        if !tx.is_open() {
            debug!(next = item.index(), "consumer gone, stopping generation");
            return;
        }
        match item {
            PlanItem::Pause { index, duration_ms } => {
                tx.send_audio(*index, ChunkKind::Silence, silence(*duration_ms, rate), rate);
            }
            PlanItem::Speech(chunk) => {
                let mut rng = chunk_rng(request.seed, chunk.index);
                let input = request.input(&chunk.text);
                let result = if Some(chunk.index) == last_speech && engine.supports_incremental() {
                    engine.generate_incremental(&input, &mut rng, &mut |piece| {
                        if tx.send_audio(chunk.index, ChunkKind::Speech, piece, rate) {
                            ControlFlow::Continue(())
                        } else {
                            ControlFlow::Break(())
                        }
                    })
                } else {
                    engine.generate(&input, &mut rng).map(|wave| {
                        tx.send_audio(chunk.index, ChunkKind::Speech, wave, rate);
                    })
                };
                if let Err(err) = result {
                    let err = Error::generation(chunk.index, err);
                    debug!(delivered = tx.sent(), error = %err, "streaming generation failed");
                    tx.fail(err);
                    return;
                }
                debug!(chunk = chunk.index, delivered = tx.sent(), "chunk streamed");
            }
        }
    }

    if tx.is_open() {
        tx.finish();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chunker::DEFAULT_MAX_WORDS;
    use crate::device::EngineConfig;
    use crate::engine::{EngineBackend, SyntheticBackend};
    use crate::lifecycle::{AcquirePolicy, ResourceManager};
    use crate::script::parse_script;

    const RATE: u32 = 24_000;

    fn request(script: &str, max_words: usize, seed: u64) -> GenerationRequest {
        GenerationRequest {
            plan: ScriptPlan::new(&parse_script(script), max_words),
            voices: vec![VoiceSample::synthetic(0, RATE), VoiceSample::synthetic(1, RATE)],
            params: GenerationParams::default(),
            seed,
        }
    }

    fn manager(backend: SyntheticBackend) -> ResourceManager {
        ResourceManager::new(Arc::new(backend), AcquirePolicy::default())
    }

    fn long_script() -> String {
        let mut s = String::new();
        for i in 0..6 {
            s.push_str(&format!("Speaker {}: Sentence number {i} is here, and it goes on. ", i % 2));
            if i == 2 {
                s.push_str("[pause:150] ");
            }
        }
        s
    }

    #[tokio::test]
    async fn test_pause_example_layout() {
        let mgr = manager(SyntheticBackend::new(RATE));
        let mut lease = mgr.acquire(&EngineConfig::new("synthetic")).await.unwrap();
        let req = request("Hello.\n[pause:200]\nWorld.", DEFAULT_MAX_WORDS, 42);

        let buf = generate_batch(lease.engine_mut(), &req).unwrap();

        let params = GenerationParams::default();
        let engine = lease.engine_mut();
        let input = |text| EngineInput { text, voices: &req.voices, params: &params };
        let hello = engine.generate(&input("Hello."), &mut chunk_rng(42, 0)).unwrap();
        let world = engine.generate(&input("World."), &mut chunk_rng(42, 2)).unwrap();

        let mut expected = hello.clone();
        expected.extend(std::iter::repeat(0.0).take(4_800));
        expected.extend(world);
        assert_eq!(buf.sample_rate, RATE);
        assert_eq!(buf.samples, expected);
    }

    #[tokio::test]
    async fn test_batch_is_deterministic() {
        let mgr = manager(SyntheticBackend::new(RATE));
        let script = long_script();

        let a = run_batch(mgr.acquire(&EngineConfig::new("s")).await.unwrap(), request(&script, 8, 7))
            .await
            .unwrap();
        let b = run_batch(mgr.acquire(&EngineConfig::new("s")).await.unwrap(), request(&script, 8, 7))
            .await
            .unwrap();
        let c = run_batch(mgr.acquire(&EngineConfig::new("s")).await.unwrap(), request(&script, 8, 8))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_streaming_matches_batch() {
        let mgr = manager(SyntheticBackend::new(RATE));
        let script = long_script();
        let cfg = EngineConfig::new("s");

        let batch = run_batch(mgr.acquire(&cfg).await.unwrap(), request(&script, 8, 3)).await.unwrap();
        let streamed = stream(
            mgr.acquire(&cfg).await.unwrap(),
            request(&script, 8, 3),
            StreamOptions::default(),
            mgr.reload_flag(),
        )
        .collect()
        .await
        .unwrap();
        assert_eq!(streamed, batch);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_final_chunk_streams_incrementally() {
        let mgr = manager(SyntheticBackend::new(RATE));
        let req = request("Short. [pause:10] This last chunk has quite a few words in it for sure.", 250, 1);
        let last = req.plan.last_speech_index().unwrap();
        let mut s = stream(mgr.acquire(&EngineConfig::new("s")).await.unwrap(), req, StreamOptions::default(), mgr.reload_flag());

        let mut per_index = std::collections::BTreeMap::new();
        while let Some(chunk) = s.next_chunk().await {
            *per_index.entry(chunk.unwrap().plan_index).or_insert(0) += 1;
        }
        assert_eq!(per_index[&0], 1);
        assert_eq!(per_index[&1], 1);
        assert!(per_index[&last] > 1);
    }

    #[tokio::test]
    async fn test_batch_failure_returns_nothing_partial() {
        let backend = SyntheticBackend::new(RATE).failing_on("explode");
        let stats = backend.stats();
        let mgr = manager(backend);
        let req = request("Fine first. [pause] Then we explode. Never reached.", 3, 0);

        let err = run_batch(mgr.acquire(&EngineConfig::new("s")).await.unwrap(), req)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation { chunk: 2, .. }), "{err}");
        assert_eq!(stats.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_streaming_failure_keeps_delivered_chunks() {
        let mgr = manager(SyntheticBackend::new(RATE).failing_on("explode"));
        let req = request("Fine first. [pause] Then we explode. Never reached.", 3, 0);
        let mut s = stream(mgr.acquire(&EngineConfig::new("s")).await.unwrap(), req, StreamOptions::default(), mgr.reload_flag());

        let mut ok = 0;
        let mut failure = None;
        while let Some(item) = s.next_chunk().await {
            match item {
                Ok(_) => ok += 1,
                Err(e) => failure = Some(e),
            }
        }
        assert_eq!(ok, 2);
        assert!(matches!(failure, Some(Error::Generation { chunk: 2, .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_consumer_releases_engine() {
        let backend = SyntheticBackend::new(RATE).with_chunk_delay(Duration::from_millis(40));
        let stats = backend.stats();
        let mgr = manager(backend);
        let req = request(&"One more sentence here. ".repeat(40), 4, 9);
        let total = req.plan.len();
        let mut s = stream(mgr.acquire(&EngineConfig::new("s")).await.unwrap(), req, StreamOptions::default(), mgr.reload_flag());

        s.next_chunk().await.unwrap().unwrap();
        drop(s);

        // The worker stops after its current chunk and unlocks the engine.
        let lease = tokio::time::timeout(Duration::from_secs(2), mgr.acquire(&EngineConfig::new("s")))
            .await
            .expect("engine released after cancellation")
            .unwrap();
        drop(lease);
        assert!(stats.calls() < total);
        assert_eq!(stats.loads(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_are_serialised() {
        let backend = SyntheticBackend::new(RATE).with_chunk_delay(Duration::from_millis(5));
        let mgr = manager(backend.clone());
        let script = long_script();
        let expected = {
            let mut engine = backend.load(&crate::device::resolve(&EngineConfig::new("s"), &backend).unwrap()).unwrap();
            generate_batch(engine.as_mut(), &request(&script, 8, 5)).unwrap()
        };

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let mgr = mgr.clone();
            let script = script.clone();
            tasks.push(tokio::spawn(async move {
                let lease = mgr.acquire(&EngineConfig::new("s")).await?;
                stream(lease, request(&script, 8, 5), StreamOptions::default(), mgr.reload_flag())
                    .collect()
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), expected);
        }
    }

    #[test]
    fn test_chunk_rng_depends_on_index() {
        use rand::Rng;
        let a: u64 = chunk_rng(1, 0).gen();
        let b: u64 = chunk_rng(1, 1).gen();
        let c: u64 = chunk_rng(1, 0).gen();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
