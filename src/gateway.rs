//! Safety gateway — drives generate → validate → cache → grant → execute.
//!
//! The gateway owns the job state machine. Code reaches the execution guard
//! only after passing static validation in the same attempt (or from the
//! cache, which by invariant only ever holds validated code). Validation
//! failures are handled inside the bounded retry loop and never surface to
//! the caller until attempts are exhausted; everything else is terminal and
//! reported as a structured [`JobReport`], never as a silent success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{CredentialBroker, Operation};
use crate::cache::ScriptCache;
use crate::config::Config;
use crate::guard::{ExecutionGuard, ExecutionOutcome, ExecutionStatus};
use crate::llm::client::extract_code_block;
use crate::llm::{CodeGenerator, Message};
use crate::manifest::{JobSpec, SourceSpec};
use crate::policy::ImportPolicy;
use crate::validator::{StaticValidator, ValidationReport};

/// Env var carrying the download grant for an object-lake source.
pub const ENV_SOURCE_URL: &str = "PIPEGATE_SOURCE_URL";
/// Env var carrying the upload grant for the target object.
pub const ENV_TARGET_URL: &str = "PIPEGATE_TARGET_URL";
/// Env var carrying the external API url for an http source.
pub const ENV_SOURCE_API_URL: &str = "PIPEGATE_SOURCE_API_URL";
/// Env var carrying the pipeline name.
pub const ENV_PIPELINE: &str = "PIPEGATE_PIPELINE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Lookup,
    Generating,
    Validating,
    CacheStore,
    Execute,
    Succeeded,
    TimedOut,
    Failed,
}

/// Terminal report of one job run.
#[derive(Debug)]
pub struct JobReport {
    pub state: JobState,
    /// Every state traversed, in order, ending in `state`.
    pub path: Vec<JobState>,
    pub fingerprint: String,
    pub attempts: u32,
    pub cache_hit: bool,
    pub execution: Option<ExecutionOutcome>,
    pub validation: Option<ValidationReport>,
    /// Infrastructure failure detail (grant issuance, …), when present.
    pub error: Option<String>,
}

pub struct SafetyGateway {
    validator: StaticValidator,
    cache: ScriptCache,
    broker: Arc<CredentialBroker>,
    guard: ExecutionGuard,
    generator: Arc<dyn CodeGenerator>,
    max_attempts: u32,
    exec_timeout: Duration,
    grant_ttl_secs: u64,
    shutdown: CancellationToken,
}

impl SafetyGateway {
    pub fn new(
        config: &Config,
        generator: Arc<dyn CodeGenerator>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let policy = ImportPolicy::from_config(&config.policy);
        info!("Import policy v{} loaded", policy.version);
        Ok(Self {
            validator: StaticValidator::new(policy),
            cache: ScriptCache::open(config.cache.dir.clone(), config.cache.ttl_secs)?,
            broker: Arc::new(CredentialBroker::new(config.storage.clone())),
            guard: ExecutionGuard::new(&config.execution),
            generator,
            max_attempts: config.gateway.max_attempts,
            exec_timeout: Duration::from_secs(config.execution.timeout_secs),
            grant_ttl_secs: config.storage.grant_ttl_secs,
            shutdown,
        })
    }

    /// Broker handle, mainly for audit trail inspection.
    pub fn broker(&self) -> &CredentialBroker {
        &self.broker
    }

    /// Runs one job to a terminal state.
    pub async fn run_job(&self, spec: &JobSpec) -> Result<JobReport> {
        let fingerprint = spec.fingerprint();
        let hex = fingerprint.hex();
        info!(
            "Job '{}' started (fingerprint {hex}, generator: {})",
            spec.pipeline_name,
            self.generator.description()
        );
        let mut path = vec![JobState::Pending];
        advance(&mut path, JobState::Lookup);

        if let Some(entry) = self.cache.get(&fingerprint) {
            // Cached code already passed validation when it was stored;
            // generation and validation are skipped entirely.
            advance(&mut path, JobState::Execute);
            return self
                .execute(spec, &entry.code, hex, 0, true, None, path)
                .await;
        }

        let system_prompt = system_prompt();
        let mut messages = vec![Message::user(render_request(spec))];
        let mut last_report: Option<ValidationReport> = None;

        for attempt in 1..=self.max_attempts {
            advance(&mut path, JobState::Generating);
            info!(
                "Generation attempt {attempt}/{} for {hex}",
                self.max_attempts
            );

            let response = match self.generator.complete(&system_prompt, &messages).await {
                Ok(response) => response,
                Err(e) => {
                    // Transport failures consume an attempt; the gateway,
                    // not the generator, owns the retry count.
                    warn!("Generation attempt {attempt} failed: {e}");
                    continue;
                }
            };

            let code = match extract_code_block(&response.text) {
                Some(code) => code,
                None => {
                    warn!("Attempt {attempt}: response contained no fenced python block");
                    messages.push(Message::assistant(response.text));
                    messages.push(Message::user(
                        "Your response did not contain a ```python code block. \
                         Reply with the complete script in a single ```python block.",
                    ));
                    continue;
                }
            };

            advance(&mut path, JobState::Validating);
            let report = self.validator.validate(&code);
            if !report.valid {
                info!(
                    "Attempt {attempt}: validation failed with {} error(s)",
                    report.errors.len()
                );
                messages.push(Message::assistant(response.text));
                messages.push(Message::user(format!(
                    "The script failed validation:\n{}\n\
                     Fix every issue and reply with the complete corrected \
                     script in a single ```python block.",
                    report.feedback()
                )));
                last_report = Some(report);
                continue;
            }

            // Persist before execution: a crash mid-execution must not
            // force re-generation on the next run.
            advance(&mut path, JobState::CacheStore);
            if let Err(e) = self.cache.put(&fingerprint, &code) {
                warn!("Cache write failed for {hex}: {e}");
            }

            advance(&mut path, JobState::Execute);
            return self
                .execute(spec, &code, hex, attempt, false, Some(report), path)
                .await;
        }

        info!(
            "Job '{}' failed: {} generation attempts exhausted",
            spec.pipeline_name, self.max_attempts
        );
        advance(&mut path, JobState::Failed);
        Ok(JobReport {
            state: JobState::Failed,
            path,
            fingerprint: hex,
            attempts: self.max_attempts,
            cache_hit: false,
            execution: Some(ExecutionOutcome::validation_failed()),
            validation: last_report,
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        spec: &JobSpec,
        code: &str,
        fingerprint: String,
        attempts: u32,
        cache_hit: bool,
        validation: Option<ValidationReport>,
        mut path: Vec<JobState>,
    ) -> Result<JobReport> {
        // Exactly the grants this job needs, never more
        let mut env = HashMap::new();
        env.insert(ENV_PIPELINE.to_string(), spec.pipeline_name.clone());

        let grants = self.issue_grants(spec, &mut env);
        if let Err(e) = grants {
            warn!("Grant issuance failed for '{}': {e}", spec.pipeline_name);
            advance(&mut path, JobState::Failed);
            return Ok(JobReport {
                state: JobState::Failed,
                path,
                fingerprint,
                attempts,
                cache_hit,
                execution: None,
                validation,
                error: Some(format!("grant issuance failed: {e}")),
            });
        }

        let outcome = self
            .guard
            .run(code, &env, self.exec_timeout, &self.shutdown)
            .await?;

        let state = match outcome.status {
            ExecutionStatus::Success => JobState::Succeeded,
            ExecutionStatus::Timeout => JobState::TimedOut,
            ExecutionStatus::RuntimeError | ExecutionStatus::ValidationFailed => JobState::Failed,
        };
        advance(&mut path, state);
        info!("Job '{}' terminal state: {state:?}", spec.pipeline_name);

        Ok(JobReport {
            state,
            path,
            fingerprint,
            attempts,
            cache_hit,
            execution: Some(outcome),
            validation,
            error: None,
        })
    }

    fn issue_grants(
        &self,
        spec: &JobSpec,
        env: &mut HashMap<String, String>,
    ) -> Result<(), crate::broker::BrokerError> {
        match &spec.source {
            SourceSpec::Object { bucket, key } => {
                let grant =
                    self.broker
                        .issue(Operation::Download, bucket, key, self.grant_ttl_secs)?;
                env.insert(ENV_SOURCE_URL.to_string(), grant.url);
            }
            SourceSpec::Http { url, .. } => {
                // External API url is a non-sensitive parameter
                env.insert(ENV_SOURCE_API_URL.to_string(), url.clone());
            }
        }
        let grant = self.broker.issue(
            Operation::Upload,
            &spec.target.bucket,
            &spec.target.key,
            self.grant_ttl_secs,
        )?;
        env.insert(ENV_TARGET_URL.to_string(), grant.url);
        Ok(())
    }
}

/// Records one state transition: logs the edge from the actual current
/// state and appends the new state to the path.
fn advance(path: &mut Vec<JobState>, to: JobState) {
    let from = path.last().copied().unwrap_or(JobState::Pending);
    debug!("State: {from:?} -> {to:?}");
    path.push(to);
}

// ── Prompt construction ────────────────────────────────────────────

fn system_prompt() -> String {
    format!(
        "You are a data engineering code generator. You write standalone \
         Python scripts for one pipeline job at a time.\n\
         Rules:\n\
         - Use only these modules: requests, boto3, pandas, numpy, pyarrow, \
           json, csv, datetime, os, and the other safe stdlib modules.\n\
         - Never use subprocess, socket, pickle, ctypes, eval, exec or input.\n\
         - Read input from the pre-signed URL in the {ENV_SOURCE_URL} or \
           {ENV_SOURCE_API_URL} environment variable; write output with an \
           HTTP PUT to the pre-signed URL in {ENV_TARGET_URL}. No other \
           credentials exist.\n\
         - Reply with exactly one complete script in a single ```python block."
    )
}

fn render_request(spec: &JobSpec) -> String {
    let mut parts = vec![format!("Pipeline: {}", spec.pipeline_name)];
    match &spec.source {
        SourceSpec::Http {
            url,
            method,
            format,
            params,
        } => {
            parts.push(format!("Source: {method} {url} (format: {format})"));
            if !params.is_empty() {
                let rendered: Vec<String> =
                    params.iter().map(|(k, v)| format!("{k}={v}")).collect();
                parts.push(format!("Query parameters: {}", rendered.join(", ")));
            }
        }
        SourceSpec::Object { bucket, key } => {
            parts.push(format!(
                "Source: object {key} in bucket {bucket}, readable via the \
                 pre-signed URL in {ENV_SOURCE_URL}"
            ));
        }
    }
    parts.push(format!(
        "Target: object {} in bucket {}, writable via HTTP PUT to the \
         pre-signed URL in {ENV_TARGET_URL}",
        spec.target.key, spec.target.bucket
    ));
    if let Some(transform) = &spec.transform {
        parts.push(format!("Transformation: {}", transform.instruction));
        if !transform.schema.is_empty() {
            let fields: Vec<String> = transform
                .schema
                .iter()
                .map(|(name, ty)| format!("{name}: {ty}"))
                .collect();
            parts.push(format!("Target schema: {{ {} }}", fields.join(", ")));
        }
    }
    parts.push("Write the script for this job.".to_string());
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CacheConfig, ExecutionConfig, GatewayConfig, LlmConfig, PolicyConfig, StorageConfig,
    };
    use crate::llm::LlmResponse;
    use crate::manifest::{ObjectRef, TransformSpec};
    use crate::validator::FindingKind;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Generator fed from a fixed queue of responses.
    struct ScriptedGenerator {
        responses: Mutex<VecDeque<String>>,
        calls: AtomicU32,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CodeGenerator for ScriptedGenerator {
        async fn complete(
            &self,
            _system_prompt: &str,
            _messages: &[Message],
        ) -> anyhow::Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("scripted generator exhausted"))?;
            Ok(LlmResponse {
                text,
                input_tokens: 0,
                output_tokens: 0,
            })
        }

        fn description(&self) -> String {
            "scripted (test)".to_string()
        }
    }

    fn test_config(cache_dir: &TempDir, work_dir: &TempDir) -> Config {
        Config {
            llm: LlmConfig {
                provider: "scripted".to_string(),
                model: "none".to_string(),
                api_key: "unused".to_string(),
                max_tokens_per_request: 4096,
                request_timeout_secs: 10,
            },
            storage: StorageConfig {
                endpoint_url: "https://s3.test.example.net".to_string(),
                region: "test".to_string(),
                access_key: "AKTEST".to_string(),
                secret_key: "SKTEST".to_string(),
                grant_ttl_secs: 600,
                max_grant_ttl_secs: 3600,
            },
            execution: ExecutionConfig {
                // /bin/true ignores the script argument and exits 0, which
                // keeps these tests independent of a Python interpreter
                interpreter: "/bin/true".to_string(),
                timeout_secs: 10,
                work_dir: work_dir.path().to_path_buf(),
                max_output_bytes: 64 * 1024,
            },
            cache: CacheConfig {
                dir: cache_dir.path().to_path_buf(),
                ttl_secs: 3600,
            },
            gateway: GatewayConfig { max_attempts: 3 },
            policy: PolicyConfig::default(),
        }
    }

    fn object_spec() -> JobSpec {
        JobSpec {
            pipeline_name: "orders-silver".to_string(),
            source: SourceSpec::Object {
                bucket: "datalake".to_string(),
                key: "layer=landing/orders.json".to_string(),
            },
            target: ObjectRef {
                bucket: "datalake".to_string(),
                key: "layer=silver/orders.parquet".to_string(),
            },
            transform: Some(TransformSpec {
                instruction: "Normalize order records".to_string(),
                schema: BTreeMap::from([("order_id".to_string(), "string".to_string())]),
            }),
        }
    }

    const BAD_RESPONSE: &str = "Here you go:\n```python\nimport subprocess\nsubprocess.run(['curl', 'https://x.example'])\n```";
    const GOOD_RESPONSE: &str = "Corrected:\n```python\nimport requests\nimport os\n\nresp = requests.get(os.environ[\"PIPEGATE_SOURCE_URL\"])\nrequests.put(os.environ[\"PIPEGATE_TARGET_URL\"], data=resp.content)\n```";

    async fn run_with(
        responses: Vec<&str>,
        cache_dir: &TempDir,
        work_dir: &TempDir,
    ) -> (JobReport, Arc<ScriptedGenerator>, SafetyGateway) {
        let generator = Arc::new(ScriptedGenerator::new(responses));
        let gateway = SafetyGateway::new(
            &test_config(cache_dir, work_dir),
            generator.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        let report = gateway.run_job(&object_spec()).await.unwrap();
        (report, generator, gateway)
    }

    // ── End-to-end scenarios ────────────────────────────

    #[tokio::test]
    async fn test_scenario_retry_with_feedback_then_success() {
        let cache_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let (report, generator, gateway) =
            run_with(vec![BAD_RESPONSE, GOOD_RESPONSE], &cache_dir, &work_dir).await;

        assert_eq!(report.state, JobState::Succeeded);
        assert_eq!(report.attempts, 2);
        assert!(!report.cache_hit);
        assert_eq!(generator.calls(), 2);
        let validation = report.validation.unwrap();
        assert!(validation.valid);
        assert_eq!(
            report.execution.unwrap().status,
            ExecutionStatus::Success
        );
        // The retry goes back to Generating from Validating, not from Lookup
        assert_eq!(
            report.path,
            vec![
                JobState::Pending,
                JobState::Lookup,
                JobState::Generating,
                JobState::Validating,
                JobState::Generating,
                JobState::Validating,
                JobState::CacheStore,
                JobState::Execute,
                JobState::Succeeded,
            ]
        );
        // Both grants were issued, exactly once each
        let audit = gateway.broker().audit_log();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().any(|r| r.operation == Operation::Download
            && r.object_key == "layer=landing/orders.json"));
        assert!(audit.iter().any(|r| r.operation == Operation::Upload
            && r.object_key == "layer=silver/orders.parquet"));
    }

    #[tokio::test]
    async fn test_scenario_cache_hit_skips_generation() {
        let cache_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();

        // First run populates the cache
        let (first, _, _) = run_with(vec![GOOD_RESPONSE], &cache_dir, &work_dir).await;
        assert_eq!(first.state, JobState::Succeeded);

        // Second run: a generator with no responses would fail any attempt
        let (second, generator, _) = run_with(vec![], &cache_dir, &work_dir).await;
        assert_eq!(second.state, JobState::Succeeded);
        assert!(second.cache_hit);
        assert_eq!(second.attempts, 0);
        assert_eq!(generator.calls(), 0);
        assert!(second.validation.is_none());
        assert_eq!(
            second.path,
            vec![
                JobState::Pending,
                JobState::Lookup,
                JobState::Execute,
                JobState::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn test_scenario_attempts_exhausted() {
        let cache_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let (report, generator, _) = run_with(
            vec![BAD_RESPONSE, BAD_RESPONSE, BAD_RESPONSE],
            &cache_dir,
            &work_dir,
        )
        .await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.attempts, 3);
        assert_eq!(generator.calls(), 3);
        // Last report attached, naming the violation
        let validation = report.validation.unwrap();
        assert!(!validation.valid);
        assert!(validation
            .errors
            .iter()
            .any(|f| f.kind == FindingKind::ImportViolation && f.symbol == "subprocess"));
        // No execution was attempted
        assert_eq!(
            report.execution.unwrap().status,
            ExecutionStatus::ValidationFailed
        );
        // Three full generate/validate cycles, then terminal failure
        assert_eq!(report.path.last(), Some(&JobState::Failed));
        assert_eq!(
            report
                .path
                .iter()
                .filter(|s| **s == JobState::Validating)
                .count(),
            3
        );
        assert!(!report.path.contains(&JobState::Execute));
    }

    #[tokio::test]
    async fn test_unfenced_responses_never_execute() {
        let cache_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let (report, generator, _) = run_with(
            vec!["no code here", "still no code", "import requests"],
            &cache_dir,
            &work_dir,
        )
        .await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(generator.calls(), 3);
        assert_eq!(
            report.execution.unwrap().status,
            ExecutionStatus::ValidationFailed
        );
    }

    #[tokio::test]
    async fn test_validated_code_is_cached_before_execution() {
        let cache_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let (report, _, _) = run_with(vec![GOOD_RESPONSE], &cache_dir, &work_dir).await;
        assert_eq!(report.state, JobState::Succeeded);

        // The cache entry exists on disk under the job fingerprint
        let hex = object_spec().fingerprint().hex();
        assert!(cache_dir.path().join(format!("{hex}.py")).exists());
        assert!(cache_dir.path().join(format!("{hex}.meta.json")).exists());
    }

    #[tokio::test]
    async fn test_broker_failure_is_terminal_not_retried() {
        let cache_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let mut config = test_config(&cache_dir, &work_dir);
        // Grant issuance will fail on the malformed endpoint
        config.storage.endpoint_url = "not a url".to_string();

        let generator = Arc::new(ScriptedGenerator::new(vec![GOOD_RESPONSE]));
        let gateway =
            SafetyGateway::new(&config, generator.clone(), CancellationToken::new()).unwrap();
        let report = gateway.run_job(&object_spec()).await.unwrap();

        assert_eq!(report.state, JobState::Failed);
        assert!(report.execution.is_none());
        assert!(report.error.unwrap().contains("grant issuance failed"));
        assert_eq!(generator.calls(), 1);
    }

    // ── Prompt construction ─────────────────────────────

    #[test]
    fn test_request_mentions_job_details() {
        let request = render_request(&object_spec());
        assert!(request.contains("orders-silver"));
        assert!(request.contains("layer=landing/orders.json"));
        assert!(request.contains("layer=silver/orders.parquet"));
        assert!(request.contains("Normalize order records"));
        assert!(request.contains("order_id: string"));
        assert!(request.contains(ENV_TARGET_URL));
    }

    #[test]
    fn test_system_prompt_states_the_rules() {
        let prompt = system_prompt();
        assert!(prompt.contains("```python"));
        assert!(prompt.contains("subprocess"));
        assert!(prompt.contains(ENV_TARGET_URL));
    }
}
