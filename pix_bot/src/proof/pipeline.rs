//! The cascading analysis pipeline: an ordered list of strategies
//! behind one trait, each independently replaceable. A stage failing
//! (error or timeout) is logged and skipped; only exhaustion of every
//! stage produces the null verdict that defers to a human. The
//! pipeline never returns an error to its caller.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use pix_core::helpers::dto::Verdict;

use super::cache::TtlCache;
use super::dto::ProofInput;
use super::ocr::{OcrClient, OcrUploadAnalyzer, OcrUrlAnalyzer};
use super::vision::VisionAnalyzer;
use crate::config::Settings;

#[async_trait]
pub trait ProofAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn analyze(&self, input: &ProofInput) -> Result<Verdict>;
}

pub struct ProofPipeline {
    stages: Vec<Box<dyn ProofAnalyzer>>,
    cache: TtlCache<String, Verdict>,
    stage_timeout: Duration,
}

impl ProofPipeline {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut stages: Vec<Box<dyn ProofAnalyzer>> = Vec::new();

        if let Some(api_key) = settings.openai_api_key.as_deref() {
            match VisionAnalyzer::new(api_key) {
                Ok(stage) => stages.push(Box::new(stage)),
                Err(e) => warn!("vision stage disabled: {}", e),
            }
        }

        let ocr = OcrClient::new(
            settings.ocr_api_url.clone(),
            settings.ocr_api_key.clone(),
            settings.auto_approve_confidence,
        );
        stages.push(Box::new(OcrUploadAnalyzer { ocr: ocr.clone() }));
        stages.push(Box::new(OcrUrlAnalyzer { ocr }));

        Self::new(
            stages,
            Duration::from_secs(settings.verdict_cache_ttl_secs),
            Duration::from_secs(settings.ocr_stage_timeout_secs),
        )
    }

    pub fn new(
        stages: Vec<Box<dyn ProofAnalyzer>>,
        cache_ttl: Duration,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            stages,
            cache: TtlCache::new(cache_ttl),
            stage_timeout,
        }
    }

    /// Runs the cascade for one proof. Memoized by txid so a retried
    /// analysis neither re-spends an external API call nor produces a
    /// second, different verdict for the same file.
    pub async fn analyze(&self, input: &ProofInput) -> Verdict {
        if let Some(cached) = self.cache.get(&input.txid) {
            info!("verdict cache hit for txid {}", input.txid);
            return cached;
        }

        for stage in &self.stages {
            match tokio::time::timeout(self.stage_timeout, stage.analyze(input)).await {
                Ok(Ok(verdict)) => {
                    info!(
                        "stage {} produced verdict for txid {}: confidence {} valid {:?}",
                        stage.name(),
                        input.txid,
                        verdict.confidence,
                        verdict.is_valid
                    );
                    self.cache.insert(input.txid.clone(), verdict.clone());
                    return verdict;
                }
                Ok(Err(e)) => {
                    warn!(
                        "stage {} failed for txid {}: {} - trying next stage",
                        stage.name(),
                        input.txid,
                        e
                    );
                }
                Err(_) => {
                    warn!(
                        "stage {} timed out after {:?} for txid {}",
                        stage.name(),
                        self.stage_timeout,
                        input.txid
                    );
                }
            }
        }

        let verdict = Verdict::manual_fallback("all automated analysis stages failed");
        self.cache.insert(input.txid.clone(), verdict.clone());
        verdict
    }

    pub fn purge_cache(&self) {
        self.cache.purge_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use pix_core::helpers::dto::{AnalysisMethod, ProofKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedStage {
        calls: Arc<AtomicUsize>,
        verdict: Option<Verdict>,
        slow: bool,
    }

    #[async_trait]
    impl ProofAnalyzer for FixedStage {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn analyze(&self, _input: &ProofInput) -> Result<Verdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.slow {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            self.verdict
                .clone()
                .ok_or_else(|| anyhow!("stage is broken"))
        }
    }

    fn input() -> ProofInput {
        ProofInput {
            txid: "TX1".into(),
            bytes: vec![1, 2, 3],
            public_url: None,
            kind: ProofKind::Image,
            expected_amount: "21.90".parse().unwrap(),
            expected_key: "teste@pix.com".into(),
        }
    }

    fn ok_verdict(confidence: u8) -> Verdict {
        Verdict {
            is_valid: Some(true),
            confidence,
            extracted_amount: None,
            key_found: true,
            method: AnalysisMethod::OcrUpload,
            reason: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_failed_stage_cascades_to_next() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let pipeline = ProofPipeline::new(
            vec![
                Box::new(FixedStage {
                    calls: first.clone(),
                    verdict: None,
                    slow: false,
                }),
                Box::new(FixedStage {
                    calls: second.clone(),
                    verdict: Some(ok_verdict(80)),
                    slow: false,
                }),
            ],
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let verdict = pipeline.analyze(&input()).await;
        assert_eq!(verdict.confidence, 80);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_yields_manual_verdict() {
        let pipeline = ProofPipeline::new(
            vec![Box::new(FixedStage {
                calls: Arc::new(AtomicUsize::new(0)),
                verdict: None,
                slow: false,
            })],
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let verdict = pipeline.analyze(&input()).await;
        assert_eq!(verdict.is_valid, None);
        assert_eq!(verdict.confidence, 0);
        assert_eq!(verdict.method, AnalysisMethod::Manual);
    }

    #[tokio::test]
    async fn test_verdict_is_memoized_by_txid() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = ProofPipeline::new(
            vec![Box::new(FixedStage {
                calls: calls.clone(),
                verdict: Some(ok_verdict(90)),
                slow: false,
            })],
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let one = pipeline.analyze(&input()).await;
        let two = pipeline.analyze(&input()).await;
        assert_eq!(one.confidence, two.confidence);
        // second call must be served from the cache
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_stage_times_out_and_cascades() {
        let pipeline = ProofPipeline::new(
            vec![
                Box::new(FixedStage {
                    calls: Arc::new(AtomicUsize::new(0)),
                    verdict: Some(ok_verdict(99)),
                    slow: true,
                }),
                Box::new(FixedStage {
                    calls: Arc::new(AtomicUsize::new(0)),
                    verdict: Some(ok_verdict(55)),
                    slow: false,
                }),
            ],
            Duration::from_secs(60),
            Duration::from_millis(50),
        );

        let verdict = pipeline.analyze(&input()).await;
        assert_eq!(verdict.confidence, 55);
    }
}
