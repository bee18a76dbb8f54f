//! Job orchestration: input image, workflow, inference, result.

use std::sync::Arc;

use vidgen_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use vidgen_comfyui::client::ComfyUIClient;
use vidgen_comfyui::retry::{Clock, TokioClock};
use vidgen_comfyui::session::{InferenceError, InferenceSession};
use vidgen_core::error::CoreError;
use vidgen_core::input::{materialize_image, Fetcher, ScratchDir, WgetFetcher};
use vidgen_core::job::{Job, JobInput};
use vidgen_core::validation::validate_workflow;
use vidgen_core::workflow::{
    default_seed, resolve_params, AdapterAvailability, GenerationParams, ModelProfile, Workflow,
};

use crate::config::HandlerConfig;
use crate::output::{extract_video, ExtractError};
use crate::response::{JobResponse, VideoResponse};

/// Errors that fail a job.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("Failed to fetch node definitions: {0}")]
    ObjectInfo(ComfyUIApiError),
}

impl HandlerError {
    /// Stable code reported in the failure payload.
    pub fn code(&self) -> &'static str {
        match self {
            HandlerError::Core(e) => e.code(),
            HandlerError::Inference(e) => e.code(),
            HandlerError::Extract(e) => e.code(),
            HandlerError::ObjectInfo(_) => "WORKFLOW_INVALID",
        }
    }
}

/// Runs video generation jobs against one ComfyUI instance.
pub struct JobHandler {
    config: HandlerConfig,
    profile: ModelProfile,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
}

impl JobHandler {
    pub fn new(config: HandlerConfig) -> Self {
        let fetcher = Arc::new(WgetFetcher::new(config.download_timeout));
        Self {
            config,
            profile: ModelProfile::wan22_5b_i2v(),
            fetcher,
            clock: Arc::new(TokioClock),
        }
    }

    /// Replace the downloader used for `image_url` inputs.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Replace the clock used between connection attempts.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Parse a raw job and run it.
    pub async fn handle_value(&self, value: serde_json::Value) -> JobResponse {
        match Job::from_value(value) {
            Ok(job) => self.handle(job).await,
            Err(e) => {
                tracing::error!(error = %e, "Rejected job");
                JobResponse::failed(&e, e.code())
            }
        }
    }

    /// Run a job, turning any failure into a failure payload.
    pub async fn handle(&self, job: Job) -> JobResponse {
        let job_id = job.id.as_deref().unwrap_or("-");
        tracing::info!(job_id, model = self.profile.tag, "Received job");

        match self.run(&job.input).await {
            Ok(response) => {
                let has_video = matches!(response, JobResponse::Video(_));
                tracing::info!(job_id, has_video, "Job finished");
                response
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, code = e.code(), "Job failed");
                JobResponse::failed(&e, e.code())
            }
        }
    }

    /// Generate one video.
    ///
    /// The scratch directory lives until this returns, so a downloaded
    /// image stays on disk while ComfyUI reads it.
    pub async fn run(&self, input: &JobInput) -> Result<JobResponse, HandlerError> {
        let scratch = ScratchDir::new(&self.config.scratch_root)?;
        let (workflow, params) = self.prepare(input, &scratch).await?;

        let session = InferenceSession::new(
            ComfyUIApi::new(self.config.api_url()),
            ComfyUIClient::new(self.config.ws_url()),
            self.config.session_config(),
        )
        .with_clock(Arc::clone(&self.clock));

        if self.config.validate_workflow {
            self.validate(&session, &workflow).await?;
        }

        let completed = session.run(&workflow.to_value()).await?;
        let artifact = extract_video(&completed.history, &self.config.output_dir).await?;
        let generation_time = completed.submitted_at.elapsed().as_secs_f64();

        let Some(artifact) = artifact else {
            return Ok(JobResponse::no_output());
        };

        tracing::info!(
            prompt_id = %completed.prompt_id,
            node_id = %artifact.node_id,
            generation_time,
            "Generation complete",
        );

        Ok(JobResponse::Video(VideoResponse {
            video: artifact.encoded,
            generation_time,
            model: self.profile.tag.to_string(),
            frames: params.length,
            steps: params.steps,
            cfg: params.cfg,
            seed: params.seed,
            width: params.width,
            height: params.height,
            prompt_id: completed.prompt_id,
        }))
    }

    /// Materialize the input image and fill in the workflow template.
    pub async fn prepare(
        &self,
        input: &JobInput,
        scratch: &ScratchDir,
    ) -> Result<(Workflow, GenerationParams), HandlerError> {
        let image = materialize_image(
            input.image_source(),
            scratch,
            self.fetcher.as_ref(),
            &self.config.default_image,
        )
        .await?;

        let mut workflow = Workflow::load(&self.config.workflow_path)?;
        let available = AdapterAvailability::probe(&self.config.lora_dir, &self.profile);
        let params = resolve_params(input, &self.profile, available, image, default_seed())?;
        workflow.apply(&self.profile.bindings, &params)?;

        Ok((workflow, params))
    }

    async fn validate(
        &self,
        session: &InferenceSession,
        workflow: &Workflow,
    ) -> Result<(), HandlerError> {
        session.wait_until_ready().await?;
        let object_info = session
            .api()
            .get_object_info()
            .await
            .map_err(HandlerError::ObjectInfo)?;

        let report = validate_workflow(workflow, &object_info);
        tracing::info!(
            nodes_checked = report.nodes_checked,
            issues = report.issues.len(),
            "Workflow validated",
        );
        report.into_result()?;
        Ok(())
    }
}
