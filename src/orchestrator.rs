//! Two-stage analysis pipeline over the service registry.
//!
//! The pipeline knows nothing about concrete providers: it selects by stage
//! and capability, recovers from a provider failure exactly once by moving to
//! the next-ranked candidate, and accounts quota atomically with the query
//! log on success.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use crate::persistence::{DbError, NewQueryLog, Persistence, User};
use crate::providers::ProviderError;
use crate::registry::{
    InvokeOptions, InvokeOutput, RegistryError, ServiceDescriptor, ServiceRegistry, ServiceType,
};
use crate::templates::{self, AnalysisType};
use crate::ApiError;

/// How many candidates a single stage may burn through: the preferred one
/// plus one fallback.
const STAGE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub analysis_type: AnalysisType,
    pub optimized_prompt: String,
    pub analysis_result: String,
    pub optimizer: ServiceDescriptor,
    pub analyzer: ServiceDescriptor,
    pub queries_used: i32,
}

pub struct AnalysisPipeline {
    registry: Arc<ServiceRegistry>,
    db: Arc<dyn Persistence>,
    max_input_length: usize,
}

impl AnalysisPipeline {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        db: Arc<dyn Persistence>,
        max_input_length: usize,
    ) -> Self {
        Self {
            registry,
            db,
            max_input_length,
        }
    }

    pub fn validate_input(&self, input: &str) -> Result<(), ApiError> {
        if input.trim().is_empty() {
            return Err(ApiError::InvalidInput(
                "user_input must not be empty".to_string(),
            ));
        }
        if input.len() > self.max_input_length {
            return Err(ApiError::InvalidInput(format!(
                "user_input exceeds the maximum length of {} characters",
                self.max_input_length
            )));
        }
        Ok(())
    }

    /// Synchronous entry point: quota gate up front, both stages, then the
    /// atomic usage-plus-log write.
    pub async fn process(
        &self,
        user: &User,
        input: &str,
        analysis_type: AnalysisType,
    ) -> Result<PipelineOutcome, ApiError> {
        self.validate_input(input)?;
        if user.queries_used >= user.queries_limit {
            return Err(ApiError::QueryLimitExceeded(format!(
                "Query limit exceeded. Used {}/{} queries.",
                user.queries_used, user.queries_limit
            )));
        }

        let started = Instant::now();
        info!(user = %user.id, %analysis_type, "starting analysis pipeline");

        let (optimized, optimizer) = match self.optimize_stage(input, analysis_type).await {
            Ok(result) => result,
            Err(e) => {
                self.log_failure(Some(user.id), input, None, started, &e).await;
                return Err(e);
            }
        };

        let (analysis, analyzer) = match self.analyze_stage(&optimized, analysis_type).await {
            Ok(result) => result,
            Err(e) => {
                self.log_failure(Some(user.id), input, Some(&optimized), started, &e)
                    .await;
                return Err(e);
            }
        };

        let entry = NewQueryLog {
            user_id: Some(user.id),
            input: input.to_string(),
            optimized_prompt: Some(optimized.clone()),
            result: Some(analysis.clone()),
            latency_ms: started.elapsed().as_millis() as i64,
            success: true,
            error_message: None,
        };
        let queries_used = match self.db.record_completion(user.id, entry).await {
            Ok(count) => count,
            Err(DbError::QuotaExhausted) => {
                // A concurrent request took the last slot between the gate
                // and the increment; this request loses.
                return Err(ApiError::QueryLimitExceeded(format!(
                    "Query limit exceeded. Used {}/{} queries.",
                    user.queries_limit, user.queries_limit
                )));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            user = %user.id,
            %analysis_type,
            latency_ms = started.elapsed().as_millis() as i64,
            "analysis pipeline completed"
        );

        Ok(PipelineOutcome {
            analysis_type,
            optimized_prompt: optimized,
            analysis_result: analysis,
            optimizer,
            analyzer,
            queries_used,
        })
    }

    /// Stage 1: rewrite the raw input into an optimized prompt.
    pub async fn optimize_stage(
        &self,
        input: &str,
        analysis_type: AnalysisType,
    ) -> Result<(String, ServiceDescriptor), ApiError> {
        let pair = templates::prompt_for(analysis_type);
        let rendered = templates::render_user_prompt(analysis_type, input);
        let opts = InvokeOptions {
            system_prompt: Some(pair.system.to_string()),
            ..Default::default()
        };
        let (output, descriptor) = self
            .run_stage(
                ServiceType::PromptOptimizer,
                analysis_type,
                &rendered,
                &opts,
            )
            .await?;
        Ok((output.content, descriptor))
    }

    /// Stage 2: run the optimized prompt through an analyzer.
    pub async fn analyze_stage(
        &self,
        optimized: &str,
        analysis_type: AnalysisType,
    ) -> Result<(String, ServiceDescriptor), ApiError> {
        let opts = InvokeOptions {
            system_prompt: Some(templates::analyzer_system_prompt().to_string()),
            ..Default::default()
        };
        let (output, descriptor) = self
            .run_stage(ServiceType::Analyzer, analysis_type, optimized, &opts)
            .await?;
        Ok((output.content, descriptor))
    }

    async fn run_stage(
        &self,
        stage: ServiceType,
        analysis_type: AnalysisType,
        input: &str,
        opts: &InvokeOptions,
    ) -> Result<(InvokeOutput, ServiceDescriptor), ApiError> {
        let ranked = self
            .registry
            .select_ranked(stage, Some(analysis_type.capability()))
            .map_err(|e| match e {
                RegistryError::NoService(_) => ApiError::NoServiceAvailable,
                RegistryError::Conflict(_) => ApiError::Internal,
            })?;

        let mut last_error: Option<ProviderError> = None;
        for (descriptor, plugin) in ranked.into_iter().take(STAGE_ATTEMPTS) {
            if last_error.is_some() {
                info!(
                    service = %descriptor.id,
                    ?stage,
                    "falling back to next registry candidate"
                );
            }
            match plugin.invoke(input, opts).await {
                Ok(output) => return Ok((output, descriptor)),
                Err(e) => {
                    warn!(service = %descriptor.id, ?stage, "service invocation failed: {e}");
                    self.registry.set_available(&descriptor.id, false);
                    last_error = Some(e);
                }
            }
        }

        Err(map_provider_error(
            last_error.expect("ranked selection is never empty"),
        ))
    }

    async fn log_failure(
        &self,
        user_id: Option<Uuid>,
        input: &str,
        optimized: Option<&str>,
        started: Instant,
        error: &ApiError,
    ) {
        let entry = NewQueryLog {
            user_id,
            input: input.to_string(),
            optimized_prompt: optimized.map(ToString::to_string),
            result: None,
            latency_ms: started.elapsed().as_millis() as i64,
            success: false,
            error_message: Some(error.code().to_string()),
        };
        if let Err(e) = self.db.insert_query_log(entry).await {
            warn!("failed to persist failure query log: {e}");
        }
    }
}

pub fn map_provider_error(error: ProviderError) -> ApiError {
    match error {
        ProviderError::RateLimited { retry_after } => ApiError::RateLimitExceeded { retry_after },
        _ => ApiError::AiService,
    }
}
