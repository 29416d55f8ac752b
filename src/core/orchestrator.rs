//! Sequences the stages of one classification and owns the CV/fallback branch.
//!
//! ```text
//! Start -> Preprocessed -> Sampled -> Classified -> Accepted ----------------------> Validated -> Done
//!                                              \-> Escalated -> FallbackRequested -> FallbackParsed -/
//! (any step) -> Failed
//! ```
//!
//! CV stages are CPU bound and run on the blocking pool; the fallback call is
//! the only network wait. A semaphore bounds concurrent runs, a per-request
//! deadline caps the fallback by what the CV stages left over, and a caller
//! supplied cancellation future aborts any wait promptly. A run cancelled
//! while its CV worker is busy keeps the worker slot until that worker
//! finishes, so the bound counts CPU work that is still in flight.

use crate::adapters::fallback::FallbackAdapter;
use crate::config::{CubeVisionConfig, ImageConfig, SamplingConfig, Thresholds};
use crate::core::classifier::ColorClassifier;
use crate::core::evaluator::{self, Verdict};
use crate::core::preprocess::preprocess;
use crate::core::sampler::sample_tiles;
use crate::core::validator;
use crate::domain::model::{
    ClassificationResult, CubeFace, FaceCandidate, PipelineState, Provenance, TileClassification,
    TileSample,
};
use crate::domain::ports::VisionBackend;
use crate::utils::error::{CubeError, Result, Stage};
use crate::utils::validation::Validate;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Everything the deterministic half of the pipeline needs. Immutable and
/// shared by all runs.
#[derive(Debug, Clone)]
pub struct CvStages {
    image: ImageConfig,
    sampling: SamplingConfig,
    classifier: ColorClassifier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CvOutcome {
    pub samples: [TileSample; 9],
    pub classifications: [TileClassification; 9],
}

impl CvOutcome {
    /// The CV answer as it stands, trusted or not.
    pub fn face(&self) -> CubeFace {
        CubeFace::from_colors(self.classifications.map(|c| c.color))
    }

    pub fn confidences(&self) -> [f32; 9] {
        evaluator::tile_confidences(&self.classifications)
    }
}

impl CvStages {
    pub fn new(config: &CubeVisionConfig) -> Self {
        Self {
            image: config.image.clone(),
            sampling: config.sampling.clone(),
            classifier: ColorClassifier::new(&config.classifier),
        }
    }

    pub fn run(&self, bytes: &[u8]) -> Result<CvOutcome> {
        let image = preprocess(bytes, &self.image)?;
        let samples = sample_tiles(&image, &self.sampling)?;
        let classifications = self.classifier.classify_all(&samples);
        Ok(CvOutcome {
            samples,
            classifications,
        })
    }
}

/// Visited states plus the wall clock of one run.
struct Run {
    states: Vec<PipelineState>,
    started: Instant,
}

impl Run {
    fn start() -> Self {
        Self {
            states: vec![PipelineState::Start],
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: PipelineState) {
        if let Some(current) = self.states.last() {
            tracing::debug!("Pipeline state {:?} -> {:?}", current, next);
        }
        self.states.push(next);
    }
}

pub struct FacePipeline {
    cv: Arc<CvStages>,
    thresholds: Thresholds,
    fallback: Option<FallbackAdapter>,
    workers: Arc<Semaphore>,
    deadline: Duration,
}

impl FacePipeline {
    /// Validate `config` and wire the backend it names.
    pub fn new(config: &CubeVisionConfig) -> Result<Self> {
        config.validate()?;
        let fallback = if config.fallback.enabled {
            let adapter =
                FallbackAdapter::from_config(&config.fallback, config.pipeline.max_concurrent)?;
            tracing::info!("Vision fallback enabled via {}", adapter.backend_name());
            Some(adapter)
        } else {
            tracing::info!("Vision fallback disabled");
            None
        };
        Ok(Self::assemble(config, fallback))
    }

    /// Like [`FacePipeline::new`] but with a caller-provided backend.
    pub fn with_backend(config: &CubeVisionConfig, backend: Arc<dyn VisionBackend>) -> Result<Self> {
        config.validate()?;
        let adapter = FallbackAdapter::new(backend, &config.fallback);
        Ok(Self::assemble(config, Some(adapter)))
    }

    fn assemble(config: &CubeVisionConfig, fallback: Option<FallbackAdapter>) -> Self {
        Self {
            cv: Arc::new(CvStages::new(config)),
            thresholds: config.thresholds,
            fallback,
            workers: Arc::new(Semaphore::new(config.pipeline.max_concurrent)),
            deadline: config.pipeline.deadline(),
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Worker slots not held by a run or by a still-running CV worker.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Run only the CV stages and the evaluator, synchronously.
    pub fn cv_verdict(&self, bytes: &[u8]) -> Result<(CvOutcome, Verdict)> {
        let outcome = self.cv.run(bytes)?;
        let verdict = evaluator::decide(&outcome.classifications, &self.thresholds);
        Ok((outcome, verdict))
    }

    pub async fn classify(&self, bytes: impl Into<Arc<[u8]>>) -> Result<ClassificationResult> {
        self.classify_until(bytes, std::future::pending()).await
    }

    /// Classify, giving up with [`CubeError::Cancelled`] as soon as `cancel`
    /// resolves. Dropping the in-flight fallback future aborts its request.
    pub async fn classify_until<F>(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        cancel: F,
    ) -> Result<ClassificationResult>
    where
        F: Future<Output = ()>,
    {
        self.classify_with_trace(bytes, cancel).await.0
    }

    /// Like [`FacePipeline::classify_until`], also returning the visited
    /// states. A failed run's trace ends in [`PipelineState::Failed`].
    pub async fn classify_with_trace<F>(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        cancel: F,
    ) -> (Result<ClassificationResult>, Vec<PipelineState>)
    where
        F: Future<Output = ()>,
    {
        let bytes: Arc<[u8]> = bytes.into();
        let mut run = Run::start();
        tokio::pin!(cancel);

        let outcome = match self.run_stages(&bytes, &mut run, cancel.as_mut()).await {
            Ok(result) => Ok(result),
            Err(e) => {
                run.advance(PipelineState::Failed);
                if e.is_cancelled() {
                    tracing::info!("Classification abandoned: {}", e);
                } else {
                    tracing::error!(
                        "❌ Classification failed at {:?}: {} (status {})",
                        e.stage(),
                        e,
                        e.http_status()
                    );
                }
                Err(e)
            }
        };
        (outcome, run.states)
    }

    async fn run_stages<F>(
        &self,
        bytes: &Arc<[u8]>,
        run: &mut Run,
        mut cancel: Pin<&mut F>,
    ) -> Result<ClassificationResult>
    where
        F: Future<Output = ()>,
    {
        let deadline = run.started + self.deadline;

        let permit = tokio::select! {
            biased;
            _ = &mut cancel => return Err(CubeError::Cancelled { stage: Stage::Preprocess }),
            permit = self.workers.clone().acquire_owned() => permit.map_err(|e| CubeError::Internal {
                message: format!("worker pool closed: {}", e),
            })?,
        };

        // shared with the CV worker so a cancelled run cannot free the slot
        // while the worker is still busy
        let permit = Arc::new(permit);
        let worker_permit = Arc::clone(&permit);
        let cv = Arc::clone(&self.cv);
        let input = Arc::clone(bytes);
        let task = tokio::task::spawn_blocking(move || {
            let _slot = worker_permit;
            cv.run(&input)
        });
        let outcome = tokio::select! {
            biased;
            _ = &mut cancel => return Err(CubeError::Cancelled { stage: Stage::Classify }),
            joined = task => joined.map_err(|e| CubeError::Internal {
                message: format!("CV worker failed: {}", e),
            })??,
        };
        run.advance(PipelineState::Preprocessed);
        run.advance(PipelineState::Sampled);
        run.advance(PipelineState::Classified);

        let verdict = evaluator::decide(&outcome.classifications, &self.thresholds);
        let summary = *verdict.summary();

        let (candidate, provenance) = match verdict {
            Verdict::Accept { face, .. } => {
                tracing::info!(
                    "✅ CV result accepted (min {:.3}, mean {:.3})",
                    summary.min,
                    summary.mean
                );
                run.advance(PipelineState::Accepted);
                (FaceCandidate::from(&face), Provenance::Cv)
            }
            Verdict::Escalate { reason, .. } => {
                tracing::warn!(
                    "CV confidence too low (min {:.3} at {}, mean {:.3}): {:?}",
                    summary.min,
                    summary.weakest,
                    summary.mean,
                    reason
                );
                run.advance(PipelineState::Escalated);

                match &self.fallback {
                    None => {
                        tracing::warn!("No vision fallback configured, returning CV result anyway");
                        (FaceCandidate::from(&outcome.face()), Provenance::Cv)
                    }
                    Some(adapter) => {
                        let budget = deadline.saturating_duration_since(Instant::now());
                        tracing::info!("Falling back to vision model (budget {:?})", budget);
                        run.advance(PipelineState::FallbackRequested);

                        let candidate = tokio::select! {
                            biased;
                            _ = &mut cancel => return Err(CubeError::Cancelled { stage: Stage::Fallback }),
                            reply = adapter.classify(bytes, budget) => reply?,
                        };
                        run.advance(PipelineState::FallbackParsed);
                        (candidate, Provenance::Fallback)
                    }
                }
            }
        };

        let face = validator::validate(&candidate).map_err(CubeError::Validation)?;
        run.advance(PipelineState::Validated);
        run.advance(PipelineState::Done);

        let elapsed_ms = run.started.elapsed().as_millis() as u64;
        tracing::info!("Face {} classified via {} in {}ms", face, provenance, elapsed_ms);

        Ok(ClassificationResult {
            face,
            tile_confidences: outcome.confidences(),
            overall_confidence: summary.mean,
            provenance,
            stages: run.states.clone(),
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{CanonicalColor, FallbackRequest, TilePosition};
    use crate::utils::error::BackendError;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    const GOOD: &str =
        r#"{"TL":"W","TC":"W","TR":"W","ML":"W","C":"W","MR":"W","BL":"W","BC":"W","BR":"W"}"#;

    struct FixedBackend {
        reply: std::result::Result<String, BackendError>,
        delay: Duration,
    }

    #[async_trait]
    impl VisionBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn generate(
            &self,
            _request: &FallbackRequest,
            _timeout: Duration,
        ) -> std::result::Result<String, BackendError> {
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn fixed(reply: &str, delay: Duration) -> Arc<dyn VisionBackend> {
        Arc::new(FixedBackend {
            reply: Ok(reply.to_string()),
            delay,
        })
    }

    fn png(colors: [[u8; 3]; 9]) -> Vec<u8> {
        let img = RgbImage::from_fn(90, 90, |x, y| Rgb(colors[((y / 30) * 3 + x / 30) as usize]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    const RED: [u8; 3] = [185, 0, 0];
    const BLUE: [u8; 3] = [0, 69, 173];
    // nearly equidistant from the red and orange references
    const MUDDY: [u8; 3] = [220, 45, 0];

    #[tokio::test]
    async fn test_confident_face_takes_cv_path() {
        let pipeline =
            FacePipeline::with_backend(&CubeVisionConfig::default(), fixed(GOOD, Duration::ZERO))
                .unwrap();

        let result = pipeline.classify(png([RED; 9])).await.unwrap();

        assert_eq!(result.provenance, Provenance::Cv);
        assert_eq!(result.face.get(TilePosition::Center), CanonicalColor::Red);
        assert_eq!(result.overall_confidence, 1.0);
        assert_eq!(
            result.stages,
            vec![
                PipelineState::Start,
                PipelineState::Preprocessed,
                PipelineState::Sampled,
                PipelineState::Classified,
                PipelineState::Accepted,
                PipelineState::Validated,
                PipelineState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_ambiguous_face_takes_fallback_path() {
        let pipeline =
            FacePipeline::with_backend(&CubeVisionConfig::default(), fixed(GOOD, Duration::ZERO))
                .unwrap();

        let mut colors = [BLUE; 9];
        colors[4] = MUDDY;
        let result = pipeline.classify(png(colors)).await.unwrap();

        assert_eq!(result.provenance, Provenance::Fallback);
        assert_eq!(result.face.get(TilePosition::Center), CanonicalColor::White);
        assert!(result.tile_confidences[4] < 0.35);
        assert!(result.stages.contains(&PipelineState::FallbackParsed));
    }

    #[tokio::test]
    async fn test_disabled_fallback_returns_cv_answer() {
        let mut config = CubeVisionConfig::default();
        config.fallback.enabled = false;
        let pipeline = FacePipeline::new(&config).unwrap();

        let mut colors = [BLUE; 9];
        colors[4] = MUDDY;
        let result = pipeline.classify(png(colors)).await.unwrap();

        assert_eq!(result.provenance, Provenance::Cv);
        assert_eq!(result.face.get(TilePosition::TopLeft), CanonicalColor::Blue);
        assert!(result.stages.contains(&PipelineState::Escalated));
    }

    #[tokio::test]
    async fn test_decode_error_fails_without_fallback() {
        let pipeline =
            FacePipeline::with_backend(&CubeVisionConfig::default(), fixed(GOOD, Duration::ZERO))
                .unwrap();

        let err = pipeline.classify(vec![1u8, 2, 3]).await.unwrap_err();
        assert!(matches!(err, CubeError::ImageDecode { .. }));
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn test_deadline_caps_the_fallback() {
        let mut config = CubeVisionConfig::default();
        config.pipeline.deadline_ms = 200;
        let pipeline =
            FacePipeline::with_backend(&config, fixed(GOOD, Duration::from_secs(30))).unwrap();

        let mut colors = [BLUE; 9];
        colors[4] = MUDDY;
        let started = Instant::now();
        let err = pipeline.classify(png(colors)).await.unwrap_err();

        assert!(matches!(err, CubeError::FallbackUnavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_on_fallback() {
        let pipeline = FacePipeline::with_backend(
            &CubeVisionConfig::default(),
            fixed(GOOD, Duration::from_secs(30)),
        )
        .unwrap();

        let mut colors = [BLUE; 9];
        colors[4] = MUDDY;
        let started = Instant::now();
        let err = pipeline
            .classify_until(png(colors), tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CubeError::Cancelled {
                stage: Stage::Fallback
            }
        ));
        assert_eq!(err.http_status(), 499);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cv_verdict_is_deterministic() {
        let pipeline = FacePipeline::with_backend(
            &CubeVisionConfig::default(),
            fixed(GOOD, Duration::ZERO),
        )
        .unwrap();
        let mut colors = [RED; 9];
        colors[2] = MUDDY;
        colors[6] = [240, 200, 30];
        let bytes = png(colors);

        let (first_outcome, first_verdict) = pipeline.cv_verdict(&bytes).unwrap();
        for _ in 0..5 {
            let (outcome, verdict) = pipeline.cv_verdict(&bytes).unwrap();
            assert_eq!(outcome, first_outcome);
            assert_eq!(verdict, first_verdict);
        }
    }

    #[tokio::test]
    async fn test_failed_run_trace_ends_in_failed() {
        let pipeline =
            FacePipeline::with_backend(&CubeVisionConfig::default(), fixed(GOOD, Duration::ZERO))
                .unwrap();

        let (result, trace) = pipeline
            .classify_with_trace(vec![1u8, 2, 3], std::future::pending())
            .await;
        assert!(matches!(result, Err(CubeError::ImageDecode { .. })));
        assert_eq!(trace, vec![PipelineState::Start, PipelineState::Failed]);

        let mut colors = [BLUE; 9];
        colors[4] = MUDDY;
        let (result, trace) = pipeline.classify_with_trace(png(colors), std::future::pending()).await;
        let result = result.unwrap();
        assert_eq!(trace, result.stages);
        assert_eq!(trace.last(), Some(&PipelineState::Done));
    }

    #[tokio::test]
    async fn test_cancelled_fallback_trace_records_failure() {
        let pipeline = FacePipeline::with_backend(
            &CubeVisionConfig::default(),
            fixed(GOOD, Duration::from_secs(30)),
        )
        .unwrap();

        let mut colors = [BLUE; 9];
        colors[4] = MUDDY;
        let (result, trace) = pipeline
            .classify_with_trace(png(colors), tokio::time::sleep(Duration::from_millis(300)))
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(
            &trace[trace.len() - 2..],
            &[PipelineState::FallbackRequested, PipelineState::Failed]
        );
    }

    #[test]
    fn test_unbounded_concurrency_is_a_config_error() {
        let mut config = CubeVisionConfig::default();
        config.pipeline.max_concurrent = usize::MAX;

        let err = FacePipeline::with_backend(&config, fixed(GOOD, Duration::ZERO))
            .err()
            .unwrap();
        assert!(matches!(err, CubeError::InvalidConfigValue { .. }));
        assert!(FacePipeline::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_run_holds_worker_until_cv_finishes() {
        let mut config = CubeVisionConfig::default();
        config.fallback.enabled = false;
        config.pipeline.max_concurrent = 1;
        let pipeline = FacePipeline::new(&config).unwrap();

        // big enough that decoding and downscaling outlast the cancel delay
        let noisy = RgbImage::from_fn(2000, 2000, |x, y| {
            let h = x.wrapping_mul(2654435761) ^ y.wrapping_mul(40503);
            Rgb([h as u8, (h >> 8) as u8, (h >> 16) as u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(noisy)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let err = pipeline
            .classify_until(bytes, tokio::time::sleep(Duration::from_millis(5)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CubeError::Cancelled {
                stage: Stage::Classify
            }
        ));
        assert_eq!(pipeline.available_workers(), 0);

        let waited = Instant::now();
        while pipeline.available_workers() == 0 {
            assert!(waited.elapsed() < Duration::from_secs(60));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.available_workers(), 1);
    }
}
