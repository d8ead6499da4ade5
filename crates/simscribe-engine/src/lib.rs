use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};
use simscribe_contracts::error::{PipelineError, Result};
use simscribe_contracts::events::{EventPayload, EventWriter};
use simscribe_contracts::models::{
    ModelSelection, ModelSelector, ModelSpec, ProviderKind, DRYRUN_SCRIPT_MODEL,
    DRYRUN_VISION_MODEL, EXTRACTION_MODEL, VISION_MODEL,
};
use uuid::Uuid;

const DEFAULT_INSTRUCTIONS: &str = include_str!("../resources/instructions.txt");

const HEAD_STR: &str = "Please generate two complete scripts according to the following description and instruction. Default names: genDB.py and DSA_SIM.py.";
const IMG_FIXED_PROMPT: &str =
    "Please describe the obstacles, simulation box, and simulated molecules in the picture.";

pub const SCENARIO_FILE: &str = "genDB.py";
pub const SIMULATION_FILE: &str = "DSA_SIM.py";

const TEMPERATURE: f32 = 0.3;

const DEEPSEEK_DEFAULT_BASE: &str = "https://api.deepseek.com/v1";
const DASHSCOPE_DEFAULT_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Provider API keys, resolved once when the engine is configured rather
/// than probed from the process environment on every call.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    deepseek: Option<String>,
    dashscope: Option<String>,
}

impl Credentials {
    pub fn new(deepseek: Option<String>, dashscope: Option<String>) -> Self {
        Self {
            deepseek,
            dashscope,
        }
    }

    pub fn from_env() -> Self {
        Self {
            deepseek: non_empty_env("API_KEY_DEEPSEEK")
                .or_else(|| non_empty_env("DEEPSEEK_API_KEY")),
            dashscope: non_empty_env("DASHSCOPE_API_KEY"),
        }
    }

    pub fn has(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Primary => self.deepseek.is_some(),
            ProviderKind::SecondaryText | ProviderKind::SecondaryVision => {
                self.dashscope.is_some()
            }
            ProviderKind::Dryrun => true,
        }
    }

    fn require(&self, kind: ProviderKind) -> Result<&str> {
        match kind {
            ProviderKind::Primary => {
                self.deepseek
                    .as_deref()
                    .ok_or(PipelineError::MissingCredential {
                        provider: "DeepSeek",
                        env_hint: "API_KEY_DEEPSEEK or DEEPSEEK_API_KEY",
                    })
            }
            ProviderKind::SecondaryText | ProviderKind::SecondaryVision => self
                .dashscope
                .as_deref()
                .ok_or(PipelineError::MissingCredential {
                    provider: "DashScope",
                    env_hint: "DASHSCOPE_API_KEY",
                }),
            ProviderKind::Dryrun => Ok(""),
        }
    }
}

/// Message content for one chat-completions call.
#[derive(Debug, Clone)]
pub enum ChatContent {
    Text(String),
    Vision {
        image_data_url: String,
        prompt: String,
    },
}

#[derive(Debug, Clone)]
pub struct ChatCallRequest {
    pub model: String,
    pub content: ChatContent,
    pub temperature: f32,
    pub timeout: Duration,
}

pub trait ChatProvider: Send + Sync {
    fn label(&self) -> &'static str;
    fn serves(&self, kind: ProviderKind) -> bool;
    fn chat(&self, request: &ChatCallRequest) -> Result<String>;
}

#[derive(Default)]
pub struct ChatProviderRegistry {
    providers: Vec<Box<dyn ChatProvider>>,
}

impl ChatProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ChatProvider + 'static>(&mut self, provider: P) {
        self.providers.push(Box::new(provider));
    }

    pub fn get(&self, kind: ProviderKind) -> Result<&dyn ChatProvider> {
        self.providers
            .iter()
            .map(|provider| provider.as_ref())
            .find(|provider| provider.serves(kind))
            .ok_or_else(|| {
                PipelineError::ConfigurationError(format!(
                    "no chat provider registered for {}",
                    kind.family_label()
                ))
            })
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.providers
            .iter()
            .map(|provider| provider.label())
            .collect()
    }
}

struct DeepSeekProvider {
    endpoint: String,
    http: HttpClient,
    api_key: Option<String>,
}

impl DeepSeekProvider {
    fn new(credentials: &Credentials) -> Self {
        Self {
            endpoint: resolved_endpoint("DEEPSEEK_API_BASE", DEEPSEEK_DEFAULT_BASE),
            http: HttpClient::new(),
            api_key: credentials.deepseek.clone(),
        }
    }
}

impl ChatProvider for DeepSeekProvider {
    fn label(&self) -> &'static str {
        "deepseek"
    }

    fn serves(&self, kind: ProviderKind) -> bool {
        matches!(kind, ProviderKind::Primary)
    }

    fn chat(&self, request: &ChatCallRequest) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(PipelineError::MissingCredential {
                provider: "DeepSeek",
                env_hint: "API_KEY_DEEPSEEK or DEEPSEEK_API_KEY",
            });
        };
        post_chat_completion("DeepSeek", &self.http, &self.endpoint, api_key, request)
    }
}

struct DashScopeProvider {
    endpoint: String,
    http: HttpClient,
    api_key: Option<String>,
}

impl DashScopeProvider {
    fn new(credentials: &Credentials) -> Self {
        Self {
            endpoint: resolved_endpoint("DASHSCOPE_API_BASE", DASHSCOPE_DEFAULT_BASE),
            http: HttpClient::new(),
            api_key: credentials.dashscope.clone(),
        }
    }
}

impl ChatProvider for DashScopeProvider {
    fn label(&self) -> &'static str {
        "dashscope"
    }

    fn serves(&self, kind: ProviderKind) -> bool {
        matches!(
            kind,
            ProviderKind::SecondaryText | ProviderKind::SecondaryVision
        )
    }

    fn chat(&self, request: &ChatCallRequest) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(PipelineError::MissingCredential {
                provider: "DashScope",
                env_hint: "DASHSCOPE_API_KEY",
            });
        };
        post_chat_completion("DashScope", &self.http, &self.endpoint, api_key, request)
    }
}

/// Offline deterministic provider: answers every call without network
/// traffic, so the full pipeline can run in demos and tests.
struct DryrunProvider;

impl DryrunProvider {
    fn combined_scripts(prompt: &str) -> String {
        let instruction = prompt
            .rsplit("[Instruction]\n")
            .next()
            .unwrap_or(prompt)
            .trim();
        format!(
            "Here are the two scripts.\n\n```python\n# {SCENARIO_FILE}\n# scenario: {excerpt}\nprint(\"scenario\")\n```\n\n```python\n# {SIMULATION_FILE}\n# simulation: {excerpt}\nprint(\"simulation\")\n```\n",
            excerpt = truncate_text(instruction, 64),
        )
    }

    fn extract_named_script(prompt: &str, filename: &str) -> Option<String> {
        let mut segments = prompt.split("```");
        segments.next();
        while let Some(block) = segments.next() {
            if block.lines().any(|line| line.contains(filename)) {
                return Some(format!("```{}```", block));
            }
            segments.next();
        }
        None
    }
}

impl ChatProvider for DryrunProvider {
    fn label(&self) -> &'static str {
        "dryrun"
    }

    fn serves(&self, kind: ProviderKind) -> bool {
        matches!(kind, ProviderKind::Dryrun)
    }

    fn chat(&self, request: &ChatCallRequest) -> Result<String> {
        match &request.content {
            ChatContent::Vision { .. } => Ok(
                "A rectangular simulation box with two slab obstacles near the center and \
                 solvent molecules filling the remaining volume."
                    .to_string(),
            ),
            ChatContent::Text(prompt) => {
                for filename in [SCENARIO_FILE, SIMULATION_FILE] {
                    if prompt.starts_with(&format!("Extract only {filename} script:")) {
                        return Ok(Self::extract_named_script(prompt, filename)
                            .unwrap_or_else(|| prompt.clone()));
                    }
                }
                Ok(Self::combined_scripts(prompt))
            }
        }
    }
}

pub fn default_provider_registry(credentials: &Credentials) -> ChatProviderRegistry {
    let mut providers = ChatProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(DeepSeekProvider::new(credentials));
    providers.register(DashScopeProvider::new(credentials));
    providers
}

fn post_chat_completion(
    provider: &'static str,
    http: &HttpClient,
    endpoint: &str,
    api_key: &str,
    request: &ChatCallRequest,
) -> Result<String> {
    let payload = completion_payload(request);
    let response = http
        .post(endpoint)
        .bearer_auth(api_key)
        .timeout(request.timeout)
        .json(&payload)
        .send()
        .map_err(|err| PipelineError::request(provider, err.to_string()))?;
    reply_text_or_raw_json(provider, response)
}

fn completion_payload(request: &ChatCallRequest) -> Value {
    let content = match &request.content {
        ChatContent::Text(text) => Value::String(text.clone()),
        ChatContent::Vision {
            image_data_url,
            prompt,
        } => json!([
            {"type": "image_url", "image_url": {"url": image_data_url}},
            {"type": "text", "text": prompt},
        ]),
    };
    json!({
        "model": request.model,
        "messages": [{"role": "user", "content": content}],
        "temperature": request.temperature,
    })
}

fn reply_text_or_raw_json(
    provider: &'static str,
    response: reqwest::blocking::Response,
) -> Result<String> {
    let code = response.status().as_u16();
    let body = response
        .text()
        .map_err(|err| PipelineError::request(provider, format!("body read failed: {err}")))?;
    parse_chat_reply(provider, code, &body)
}

/// Pull `choices[0].message.content` out of a chat-completions reply body.
/// A success-status body without that field is returned as raw JSON text
/// instead of failing the run; a non-success status carries a truncated
/// body excerpt in the error.
fn parse_chat_reply(provider: &'static str, code: u16, body: &str) -> Result<String> {
    if !(200..300).contains(&code) {
        return Err(PipelineError::request(
            provider,
            format!("({code}): {}", truncate_text(body, 512)),
        ));
    }
    let parsed: Value = serde_json::from_str(body)
        .map_err(|_| PipelineError::request(provider, "invalid JSON payload".to_string()))?;
    let content = parsed
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty());
    match content {
        Some(text) => Ok(text.to_string()),
        None => Ok(parsed.to_string()),
    }
}

fn resolved_endpoint(env_key: &str, default_base: &str) -> String {
    let base = env::var(env_key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_base.to_string());
    format!("{base}/chat/completions")
}

/// Encode a sketch file as a base64 data URL. Mime type comes from the
/// extension: png/webp/bmp map directly, anything else is sent as jpeg.
pub fn file_to_data_url(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(PipelineError::FileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    };
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

const FENCE_LANGUAGE_TAGS: &[&str] = &["python", "py", "bash", "sh", "text", ""];

/// Return the body of the first fenced code block, dropping a recognized
/// leading language tag; text without fence markers passes through
/// unchanged. Only the first block is ever considered — later blocks are
/// ignored by policy, since the extraction prompt asks for a single script.
pub fn strip_code_fences(text: &str) -> String {
    if !text.contains("```") {
        return text.to_string();
    }
    let parts: Vec<&str> = text.split("```").collect();
    if let Some(block) = parts.get(1) {
        return match block.split_once('\n') {
            Some((first_line, rest)) => {
                let tag = first_line.trim().to_ascii_lowercase();
                if FENCE_LANGUAGE_TAGS.contains(&tag.as_str()) {
                    rest.trim().to_string()
                } else {
                    block.trim().to_string()
                }
            }
            None => block.trim().to_string(),
        };
    }
    text.to_string()
}

/// Deterministic prompt assembly. The image-analysis section is present
/// only when a non-empty description was produced.
pub fn compose_prompt(
    image_description: Option<&str>,
    documentation: &str,
    user_text: &str,
) -> String {
    match image_description.map(str::trim).filter(|text| !text.is_empty()) {
        Some(description) => format!(
            "{HEAD_STR}\n\n[Image Analysis]\n{description}\n\n[Documentation]\n{documentation}\n\n[Instruction]\n{user_text}\n"
        ),
        None => format!(
            "{HEAD_STR}\n\n[Documentation]\n{documentation}\n\n[Instruction]\n{user_text}\n"
        ),
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

fn diff_stats(previous: &str, current: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(previous, current);
    let mut added = 0;
    let mut removed = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }
    (added, removed)
}

/// Issues generation-stamped run tokens. Beginning a new run invalidates
/// every token issued before it; an in-flight run observes that at its next
/// stage boundary and stops before overwriting the outputs.
#[derive(Debug, Clone, Default)]
pub struct RunCoordinator {
    generation: Arc<AtomicU64>,
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> RunToken {
        let issued = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        RunToken {
            generation: Arc::clone(&self.generation),
            issued,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunToken {
    generation: Arc<AtomicU64>,
    issued: u64,
}

impl RunToken {
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.issued
    }

    pub fn generation(&self) -> u64 {
        self.issued
    }
}

/// Progress reports delivered back to the initiating thread. Full reply
/// text travels only here, never into the event log.
#[derive(Debug, Clone)]
pub enum PipelineUpdate {
    Status(String),
    ImageAnalysis(String),
    CombinedReply { model: String, text: String },
    ScriptExtracted { filename: String, body: String },
    ScriptSaved {
        path: PathBuf,
        lines_added: usize,
        lines_removed: usize,
    },
    RunSuperseded,
    RunFailed(String),
    RunFinished {
        scenario_path: PathBuf,
        simulation_path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub out_dir: PathBuf,
    pub scenario_filename: String,
    pub simulation_filename: String,
    pub documentation: String,
    pub temperature: f32,
    pub credentials: Credentials,
}

impl EngineConfig {
    pub fn new(out_dir: impl Into<PathBuf>, credentials: Credentials) -> Self {
        Self {
            out_dir: out_dir.into(),
            scenario_filename: SCENARIO_FILE.to_string(),
            simulation_filename: SIMULATION_FILE.to_string(),
            documentation: DEFAULT_INSTRUCTIONS.to_string(),
            temperature: TEMPERATURE,
            credentials,
        }
    }

    pub fn with_documentation(mut self, documentation: impl Into<String>) -> Self {
        self.documentation = documentation.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.documentation.trim().is_empty() {
            return Err(PipelineError::ConfigurationError(
                "documentation text is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub user_text: String,
    pub image_path: Option<PathBuf>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        scenario_path: PathBuf,
        simulation_path: PathBuf,
    },
    /// A newer run was started while this one was in flight; nothing was
    /// written.
    Superseded,
}

struct ResolvedModels {
    script: ModelSelection,
    extract: ModelSpec,
    vision: Option<ModelSpec>,
}

pub struct ScriptEngine {
    config: EngineConfig,
    events: EventWriter,
    selector: ModelSelector,
    providers: ChatProviderRegistry,
}

impl ScriptEngine {
    pub fn new(config: EngineConfig, events_path: impl Into<PathBuf>) -> Result<Self> {
        let providers = default_provider_registry(&config.credentials);
        Self::with_providers(config, events_path, providers)
    }

    pub fn with_providers(
        config: EngineConfig,
        events_path: impl Into<PathBuf>,
        providers: ChatProviderRegistry,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.out_dir)?;
        let run_id = format!("run-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let events = EventWriter::new(events_path.into(), run_id);
        let engine = Self {
            config,
            events,
            selector: ModelSelector::new(None),
            providers,
        };
        engine.emit(
            "run_started",
            map_object(json!({
                "out_dir": engine.config.out_dir.to_string_lossy().to_string(),
            })),
        )?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelSpec> {
        self.selector.registry.list()
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn scenario_path(&self) -> PathBuf {
        self.config.out_dir.join(&self.config.scenario_filename)
    }

    pub fn simulation_path(&self) -> PathBuf {
        self.config.out_dir.join(&self.config.simulation_filename)
    }

    /// Run the whole pipeline for one request. Strictly sequential: vision
    /// (optional), compose, generate, extract twice, persist. The first
    /// failure aborts the run and leaves files from prior runs untouched.
    pub fn run(
        &self,
        request: &GenerationRequest,
        token: &RunToken,
        updates: Option<&Sender<PipelineUpdate>>,
    ) -> Result<RunOutcome> {
        match self.run_stages(request, token, updates) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let _ = self.emit(
                    "generation_failed",
                    map_object(json!({
                        "generation": token.generation(),
                        "error": err.to_string(),
                    })),
                );
                send_update(updates, PipelineUpdate::RunFailed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Write one script's current content to a caller-chosen path (the
    /// front end's "save as"). Overwrites unconditionally.
    pub fn save_script_as(&self, path: &Path, content: &str) -> Result<PathBuf> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let normalized = normalize_newlines(content);
        fs::write(path, normalized.as_bytes())?;
        self.emit(
            "script_saved",
            map_object(json!({
                "path": path.to_string_lossy().to_string(),
                "bytes": normalized.len(),
                "sha256": content_digest(&normalized),
                "save_as": true,
            })),
        )?;
        Ok(path.to_path_buf())
    }

    fn run_stages(
        &self,
        request: &GenerationRequest,
        token: &RunToken,
        updates: Option<&Sender<PipelineUpdate>>,
    ) -> Result<RunOutcome> {
        let user_text = request.user_text.trim();
        if user_text.is_empty() && request.image_path.is_none() {
            return Err(PipelineError::EmptyRequest);
        }

        let models = self.resolve_models(request)?;
        self.check_credentials(&models)?;

        // Stage 1: optional sketch description.
        let image_description = match (&request.image_path, &models.vision) {
            (Some(image_path), Some(vision_spec)) => {
                self.status(
                    token,
                    updates,
                    format!("Analyzing sketch with {}…", vision_spec.name),
                )?;
                let data_url = file_to_data_url(image_path)?;
                let description = self.chat(
                    vision_spec,
                    ChatContent::Vision {
                        image_data_url: data_url,
                        prompt: IMG_FIXED_PROMPT.to_string(),
                    },
                )?;
                self.emit(
                    "image_analyzed",
                    map_object(json!({
                        "generation": token.generation(),
                        "model": vision_spec.name,
                        "chars": description.chars().count(),
                    })),
                )?;
                send_update(updates, PipelineUpdate::ImageAnalysis(description.clone()));
                if !token.is_current() {
                    return self.superseded(token, updates);
                }
                Some(description)
            }
            _ => None,
        };

        // Stage 2: deterministic composition.
        let composed = compose_prompt(
            image_description.as_deref(),
            &self.config.documentation,
            user_text,
        );

        // Stage 3: main generation.
        let script_label = if models.script.defaulted {
            format!("{} (default)", models.script.model.name)
        } else {
            models.script.model.name.clone()
        };
        self.status(
            token,
            updates,
            format!("Generating scripts with {script_label}…"),
        )?;
        let combined_reply = self.chat(&models.script.model, ChatContent::Text(composed))?;
        self.emit(
            "scripts_generated",
            map_object(json!({
                "generation": token.generation(),
                "model": models.script.model.name,
                "defaulted": models.script.defaulted,
                "chars": combined_reply.chars().count(),
            })),
        )?;
        send_update(
            updates,
            PipelineUpdate::CombinedReply {
                model: models.script.model.name.clone(),
                text: combined_reply.clone(),
            },
        );
        if !token.is_current() {
            return self.superseded(token, updates);
        }

        // Stage 4: pull each script out of the combined reply.
        let mut bodies = Vec::with_capacity(2);
        for filename in [
            self.config.scenario_filename.as_str(),
            self.config.simulation_filename.as_str(),
        ] {
            self.status(token, updates, format!("Extracting {filename}…"))?;
            let prompt = format!("Extract only {filename} script:\n\n{combined_reply}");
            let body = strip_code_fences(&self.chat(&models.extract, ChatContent::Text(prompt))?);
            self.emit(
                "script_extracted",
                map_object(json!({
                    "generation": token.generation(),
                    "file": filename,
                    "model": models.extract.name,
                    "chars": body.chars().count(),
                })),
            )?;
            send_update(
                updates,
                PipelineUpdate::ScriptExtracted {
                    filename: filename.to_string(),
                    body: body.clone(),
                },
            );
            if !token.is_current() {
                return self.superseded(token, updates);
            }
            bodies.push(body);
        }

        // Stage 5: persist. The token is re-checked immediately before the
        // writes so a superseded run can never clobber a newer one.
        if !token.is_current() {
            return self.superseded(token, updates);
        }
        let scenario_path = self.scenario_path();
        let simulation_path = self.simulation_path();
        for (path, body) in [(&scenario_path, &bodies[0]), (&simulation_path, &bodies[1])] {
            let saved = self.persist_script(path, body)?;
            self.emit(
                "script_saved",
                map_object(json!({
                    "generation": token.generation(),
                    "path": path.to_string_lossy().to_string(),
                    "bytes": saved.bytes,
                    "sha256": saved.digest,
                    "lines_added": saved.lines_added,
                    "lines_removed": saved.lines_removed,
                })),
            )?;
            send_update(
                updates,
                PipelineUpdate::ScriptSaved {
                    path: path.clone(),
                    lines_added: saved.lines_added,
                    lines_removed: saved.lines_removed,
                },
            );
        }

        self.emit(
            "run_finished",
            map_object(json!({
                "generation": token.generation(),
                "scenario_path": scenario_path.to_string_lossy().to_string(),
                "simulation_path": simulation_path.to_string_lossy().to_string(),
            })),
        )?;
        send_update(
            updates,
            PipelineUpdate::RunFinished {
                scenario_path: scenario_path.clone(),
                simulation_path: simulation_path.clone(),
            },
        );
        Ok(RunOutcome::Completed {
            scenario_path,
            simulation_path,
        })
    }

    fn resolve_models(&self, request: &GenerationRequest) -> Result<ResolvedModels> {
        let script = self.selector.select(request.model.as_deref(), "script")?;
        // Dryrun script models keep the whole run offline.
        let dryrun = script.model.provider.is_dryrun();
        let extract_name = if dryrun {
            DRYRUN_SCRIPT_MODEL
        } else {
            EXTRACTION_MODEL
        };
        let extract = self.selector.select(Some(extract_name), "extract")?.model;
        let vision = if request.image_path.is_some() {
            let vision_name = if dryrun {
                DRYRUN_VISION_MODEL
            } else {
                VISION_MODEL
            };
            Some(self.selector.select(Some(vision_name), "vision")?.model)
        } else {
            None
        };
        Ok(ResolvedModels {
            script,
            extract,
            vision,
        })
    }

    /// Entry guard: every provider family the run will touch must hold a
    /// credential before the first network call is attempted.
    fn check_credentials(&self, models: &ResolvedModels) -> Result<()> {
        self.config.credentials.require(models.script.model.provider)?;
        self.config.credentials.require(models.extract.provider)?;
        if let Some(vision) = &models.vision {
            self.config.credentials.require(vision.provider)?;
        }
        Ok(())
    }

    fn chat(&self, spec: &ModelSpec, content: ChatContent) -> Result<String> {
        let provider = self.providers.get(spec.provider)?;
        provider.chat(&ChatCallRequest {
            model: spec.name.clone(),
            content,
            temperature: self.config.temperature,
            timeout: Duration::from_secs(spec.timeout_secs),
        })
    }

    fn persist_script(&self, path: &Path, body: &str) -> Result<SavedScript> {
        let normalized = normalize_newlines(body);
        let previous = fs::read_to_string(path).unwrap_or_default();
        let (lines_added, lines_removed) = diff_stats(&previous, &normalized);
        fs::write(path, normalized.as_bytes())?;
        Ok(SavedScript {
            bytes: normalized.len(),
            digest: content_digest(&normalized),
            lines_added,
            lines_removed,
        })
    }

    fn status(
        &self,
        token: &RunToken,
        updates: Option<&Sender<PipelineUpdate>>,
        text: String,
    ) -> Result<()> {
        self.emit(
            "status_update",
            map_object(json!({
                "generation": token.generation(),
                "status": text,
            })),
        )?;
        send_update(updates, PipelineUpdate::Status(text));
        Ok(())
    }

    fn superseded(
        &self,
        token: &RunToken,
        updates: Option<&Sender<PipelineUpdate>>,
    ) -> Result<RunOutcome> {
        self.emit(
            "run_superseded",
            map_object(json!({ "generation": token.generation() })),
        )?;
        send_update(updates, PipelineUpdate::RunSuperseded);
        Ok(RunOutcome::Superseded)
    }

    fn emit(&self, event_type: &str, payload: EventPayload) -> Result<()> {
        self.events
            .emit(event_type, payload)
            .map_err(|err| PipelineError::EventStream(err.to_string()))?;
        Ok(())
    }
}

struct SavedScript {
    bytes: usize,
    digest: String,
    lines_added: usize,
    lines_removed: usize,
}

fn send_update(updates: Option<&Sender<PipelineUpdate>>, update: PipelineUpdate) {
    // The receiver may already be gone; a run never fails on that.
    if let Some(sender) = updates {
        let _ = sender.send(update);
    }
}

fn map_object(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Mutex;

    use serde_json::Value;
    use simscribe_contracts::models::DRYRUN_SCRIPT_MODEL;

    use super::*;

    /// Test double: returns queued replies in order and counts calls, so
    /// tests can assert that guarded paths never reach a provider.
    struct ScriptedProvider {
        replies: Mutex<VecDeque<String>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProvider {
        fn new(replies: &[&str], calls: Arc<AtomicUsize>) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|text| text.to_string()).collect()),
                calls,
            }
        }
    }

    impl ChatProvider for ScriptedProvider {
        fn label(&self) -> &'static str {
            "scripted"
        }

        fn serves(&self, _kind: ProviderKind) -> bool {
            true
        }

        fn chat(&self, _request: &ChatCallRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().expect("replies lock");
            replies
                .pop_front()
                .ok_or_else(|| PipelineError::request("scripted", "no reply queued".to_string()))
        }
    }

    fn scripted_engine(
        out_dir: &Path,
        events_path: &Path,
        replies: &[&str],
        calls: Arc<AtomicUsize>,
    ) -> ScriptEngine {
        let mut providers = ChatProviderRegistry::new();
        providers.register(ScriptedProvider::new(replies, calls));
        let config = EngineConfig::new(
            out_dir,
            Credentials::new(Some("sk-test".to_string()), Some("sk-test".to_string())),
        )
        .with_documentation("DOC");
        ScriptEngine::with_providers(config, events_path, providers).expect("engine")
    }

    fn event_types(events_path: &Path) -> Vec<String> {
        fs::read_to_string(events_path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[test]
    fn strip_fences_removes_recognized_tag_line() {
        let reply = "Here:\n```python\nprint(1)\n```\nDone";
        assert_eq!(strip_code_fences(reply), "print(1)");
    }

    #[test]
    fn strip_fences_keeps_unrecognized_first_line() {
        let reply = "```import numpy as np\nx = 1\n```";
        assert_eq!(strip_code_fences(reply), "import numpy as np\nx = 1");
    }

    #[test]
    fn strip_fences_handles_blank_tag_and_single_line_block() {
        assert_eq!(strip_code_fences("```\nx = 1\n```"), "x = 1");
        assert_eq!(strip_code_fences("```x = 1```"), "x = 1");
    }

    #[test]
    fn strip_fences_passes_plain_text_through() {
        let reply = "no fences here\njust text";
        assert_eq!(strip_code_fences(reply), reply);
    }

    #[test]
    fn strip_fences_only_considers_first_block() {
        let reply = "```python\nfirst\n```\nmiddle\n```python\nsecond\n```";
        assert_eq!(strip_code_fences(reply), "first");
    }

    #[test]
    fn compose_without_image_matches_documented_shape() {
        let composed = compose_prompt(None, "DOC", "Simulate 10 particles in a box");
        assert_eq!(
            composed,
            format!(
                "{HEAD_STR}\n\n[Documentation]\nDOC\n\n[Instruction]\nSimulate 10 particles in a box\n"
            )
        );
    }

    #[test]
    fn compose_with_image_inserts_analysis_section() {
        let composed = compose_prompt(Some("two slabs"), "DOC", "go");
        assert_eq!(
            composed,
            format!(
                "{HEAD_STR}\n\n[Image Analysis]\ntwo slabs\n\n[Documentation]\nDOC\n\n[Instruction]\ngo\n"
            )
        );
        // Blank description composes exactly like no description.
        assert_eq!(
            compose_prompt(Some("  "), "DOC", "go"),
            compose_prompt(None, "DOC", "go")
        );
    }

    #[test]
    fn compose_is_deterministic() {
        let one = compose_prompt(Some("sketch"), "DOC", "text");
        let two = compose_prompt(Some("sketch"), "DOC", "text");
        assert_eq!(one, two);
    }

    #[test]
    fn data_url_mime_follows_extension() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let png = temp.path().join("sketch.png");
        fs::write(&png, [0x89, 0x50, 0x4e, 0x47])?;
        assert!(file_to_data_url(&png)?.starts_with("data:image/png;base64,"));

        let unknown = temp.path().join("sketch.tiff");
        fs::write(&unknown, [0u8; 4])?;
        assert!(file_to_data_url(&unknown)?.starts_with("data:image/jpeg;base64,"));
        Ok(())
    }

    #[test]
    fn data_url_missing_file_is_file_not_found() {
        let err = file_to_data_url(Path::new("/no/such/sketch.png")).expect_err("missing file");
        assert!(matches!(err, PipelineError::FileNotFound(_)));
    }

    #[test]
    fn reply_parsing_extracts_message_content() {
        let body = r#"{"choices":[{"message":{"content":"  hello  "}}]}"#;
        assert_eq!(
            parse_chat_reply("DeepSeek", 200, body).expect("content"),
            "hello"
        );
    }

    #[test]
    fn reply_without_content_field_passes_raw_json_through() {
        let body = r#"{"choices":[],"usage":{"total_tokens":12}}"#;
        let reply = parse_chat_reply("DeepSeek", 200, body).expect("raw fallback");
        assert!(reply.contains("total_tokens"));
    }

    #[test]
    fn non_success_status_is_a_request_error_with_excerpt() {
        let body = "x".repeat(2000);
        let err = parse_chat_reply("DashScope", 503, &body).expect_err("non-2xx must fail");
        match err {
            PipelineError::RequestError { provider, detail } => {
                assert_eq!(provider, "DashScope");
                assert!(detail.starts_with("(503): "));
                // Excerpt stays bounded even for a long body.
                assert!(detail.chars().count() < 600);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_json_success_body_is_a_request_error() {
        let err = parse_chat_reply("DeepSeek", 200, "<html>oops</html>").expect_err("bad json");
        assert!(matches!(err, PipelineError::RequestError { .. }));
    }

    #[test]
    fn pipeline_writes_two_extracted_scripts() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let calls = Arc::new(AtomicUsize::new(0));
        let combined = "Both scripts:\n```python\n# genDB.py\nprint(\"gen\")\n```\n```python\n# DSA_SIM.py\nprint(\"sim\")\n```";
        let engine = scripted_engine(
            temp.path(),
            &events_path,
            &[
                combined,
                "```python\nprint(\"gen\")\n```",
                "```python\nprint(\"sim\")\n```",
            ],
            Arc::clone(&calls),
        );

        let coordinator = RunCoordinator::new();
        let token = coordinator.begin();
        let request = GenerationRequest {
            user_text: "Simulate 10 particles in a box".to_string(),
            image_path: None,
            model: None,
        };
        let outcome = engine.run(&request, &token, None)?;

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            fs::read_to_string(temp.path().join(SCENARIO_FILE))?,
            "print(\"gen\")"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join(SIMULATION_FILE))?,
            "print(\"sim\")"
        );

        let types = event_types(&events_path);
        let first = types.first().map(String::as_str);
        let last = types.last().map(String::as_str);
        assert_eq!(first, Some("run_started"));
        assert_eq!(last, Some("run_finished"));
        assert_eq!(
            types.iter().filter(|name| *name == "script_saved").count(),
            2
        );
        Ok(())
    }

    #[test]
    fn event_log_never_contains_reply_text() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let calls = Arc::new(AtomicUsize::new(0));
        let combined =
            "```python\n# genDB.py\nsecret_gen_body\n```\n```python\n# DSA_SIM.py\nsecret_sim_body\n```";
        let engine = scripted_engine(
            temp.path(),
            &events_path,
            &[combined, "secret_gen_body", "secret_sim_body"],
            calls,
        );

        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "box".to_string(),
            image_path: None,
            model: None,
        };
        engine.run(&request, &token, None)?;

        let log = fs::read_to_string(&events_path)?;
        assert!(!log.contains("secret_gen_body"));
        assert!(!log.contains("secret_sim_body"));
        Ok(())
    }

    #[test]
    fn updates_stream_replies_to_the_front_end() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let calls = Arc::new(AtomicUsize::new(0));
        let combined = "```python\n# genDB.py\ngen\n```\n```python\n# DSA_SIM.py\nsim\n```";
        let engine = scripted_engine(
            temp.path(),
            &events_path,
            &[combined, "gen", "sim"],
            calls,
        );

        let (sender, receiver) = mpsc::channel();
        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "box".to_string(),
            image_path: None,
            model: None,
        };
        engine.run(&request, &token, Some(&sender))?;
        drop(sender);

        let updates: Vec<PipelineUpdate> = receiver.iter().collect();
        assert!(updates
            .iter()
            .any(|update| matches!(update, PipelineUpdate::CombinedReply { text, .. } if text.contains("genDB.py"))));
        // No explicit model was requested, so the status names the default.
        assert!(updates
            .iter()
            .any(|update| matches!(update, PipelineUpdate::Status(text) if text.contains("(default)"))));
        assert!(updates
            .iter()
            .any(|update| matches!(update, PipelineUpdate::RunFinished { .. })));
        Ok(())
    }

    #[test]
    fn missing_credential_blocks_before_any_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut providers = ChatProviderRegistry::new();
        providers.register(ScriptedProvider::new(&["unused"], Arc::clone(&calls)));
        let config = EngineConfig::new(temp.path(), Credentials::new(None, None))
            .with_documentation("DOC");
        let engine =
            ScriptEngine::with_providers(config, temp.path().join("events.jsonl"), providers)?;

        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "box".to_string(),
            image_path: None,
            model: None,
        };
        let err = engine.run(&request, &token, None).expect_err("no key");
        assert!(matches!(err, PipelineError::MissingCredential { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn unknown_model_rejected_before_any_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = scripted_engine(
            temp.path(),
            &temp.path().join("events.jsonl"),
            &["unused"],
            Arc::clone(&calls),
        );

        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "box".to_string(),
            image_path: None,
            model: Some("gpt-unknown".to_string()),
        };
        let err = engine.run(&request, &token, None).expect_err("unknown");
        assert!(matches!(err, PipelineError::UnknownModel(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn empty_request_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = scripted_engine(
            temp.path(),
            &temp.path().join("events.jsonl"),
            &["unused"],
            Arc::clone(&calls),
        );

        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "   ".to_string(),
            image_path: None,
            model: None,
        };
        let err = engine.run(&request, &token, None).expect_err("empty");
        assert!(matches!(err, PipelineError::EmptyRequest));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn remote_failure_aborts_without_touching_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let calls = Arc::new(AtomicUsize::new(0));
        // Only one reply queued: the first extraction call fails.
        let combined = "```python\n# genDB.py\ngen\n```\n```python\n# DSA_SIM.py\nsim\n```";
        let engine = scripted_engine(temp.path(), &events_path, &[combined], calls);

        let prior = temp.path().join(SCENARIO_FILE);
        fs::write(&prior, "previous run output\n")?;

        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "box".to_string(),
            image_path: None,
            model: None,
        };
        let err = engine.run(&request, &token, None).expect_err("extraction fails");
        assert!(matches!(err, PipelineError::RequestError { .. }));
        assert_eq!(fs::read_to_string(&prior)?, "previous run output\n");
        assert!(event_types(&events_path).contains(&"generation_failed".to_string()));
        Ok(())
    }

    #[test]
    fn superseded_run_never_persists() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let calls = Arc::new(AtomicUsize::new(0));
        let combined = "```python\n# genDB.py\ngen\n```\n```python\n# DSA_SIM.py\nsim\n```";
        let engine = scripted_engine(
            temp.path(),
            &events_path,
            &[combined, "gen", "sim"],
            Arc::clone(&calls),
        );

        let coordinator = RunCoordinator::new();
        let stale = coordinator.begin();
        let _current = coordinator.begin();
        let request = GenerationRequest {
            user_text: "box".to_string(),
            image_path: None,
            model: None,
        };
        let outcome = engine.run(&request, &stale, None)?;

        assert_eq!(outcome, RunOutcome::Superseded);
        // The stale run stopped at its first token check, after one call.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!temp.path().join(SCENARIO_FILE).exists());
        assert!(!temp.path().join(SIMULATION_FILE).exists());
        assert!(event_types(&events_path).contains(&"run_superseded".to_string()));
        Ok(())
    }

    #[test]
    fn dryrun_pipeline_completes_offline() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = EngineConfig::new(temp.path(), Credentials::new(None, None));
        let engine = ScriptEngine::new(config, temp.path().join("events.jsonl"))?;

        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "Simulate 10 particles in a box".to_string(),
            image_path: None,
            model: Some(DRYRUN_SCRIPT_MODEL.to_string()),
        };
        let outcome = engine.run(&request, &token, None)?;

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let scenario = fs::read_to_string(temp.path().join(SCENARIO_FILE))?;
        let simulation = fs::read_to_string(temp.path().join(SIMULATION_FILE))?;
        assert!(scenario.contains("scenario"));
        assert!(simulation.contains("simulation"));
        assert!(!scenario.contains("```"));
        Ok(())
    }

    #[test]
    fn overwrite_reports_diff_stats() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let calls = Arc::new(AtomicUsize::new(0));
        let combined = "```python\n# genDB.py\nnew line\n```\n```python\n# DSA_SIM.py\nsim\n```";
        let engine = scripted_engine(
            temp.path(),
            &events_path,
            &[combined, "new line", "sim"],
            calls,
        );
        fs::write(temp.path().join(SCENARIO_FILE), "old line\n")?;

        let (sender, receiver) = mpsc::channel();
        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "box".to_string(),
            image_path: None,
            model: None,
        };
        engine.run(&request, &token, Some(&sender))?;
        drop(sender);

        let saved: Vec<(usize, usize)> = receiver
            .iter()
            .filter_map(|update| match update {
                PipelineUpdate::ScriptSaved {
                    lines_added,
                    lines_removed,
                    ..
                } => Some((lines_added, lines_removed)),
                _ => None,
            })
            .collect();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0], (1, 1));
        Ok(())
    }

    #[test]
    fn save_as_normalizes_newlines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = ScriptEngine::new(
            EngineConfig::new(temp.path(), Credentials::new(None, None)),
            temp.path().join("events.jsonl"),
        )?;
        let target = temp.path().join("exported").join("genDB.py");
        engine.save_script_as(&target, "a\r\nb\rc\n")?;
        assert_eq!(fs::read_to_string(&target)?, "a\nb\nc\n");
        Ok(())
    }

    #[test]
    fn empty_documentation_is_a_configuration_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::new(temp.path(), Credentials::new(None, None))
            .with_documentation("  \n");
        let err = ScriptEngine::new(config, temp.path().join("events.jsonl"))
            .err()
            .expect("must fail");
        assert!(matches!(err, PipelineError::ConfigurationError(_)));
    }

    #[test]
    fn vision_stage_uses_data_url_and_description() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let sketch = temp.path().join("sketch.png");
        fs::write(&sketch, [0x89, 0x50, 0x4e, 0x47])?;

        let calls = Arc::new(AtomicUsize::new(0));
        let combined = "```python\n# genDB.py\ngen\n```\n```python\n# DSA_SIM.py\nsim\n```";
        let engine = scripted_engine(
            temp.path(),
            &events_path,
            &["two slabs in a box", combined, "gen", "sim"],
            Arc::clone(&calls),
        );

        let (sender, receiver) = mpsc::channel();
        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "go".to_string(),
            image_path: Some(sketch),
            model: None,
        };
        engine.run(&request, &token, Some(&sender))?;
        drop(sender);

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let saw_analysis = receiver.iter().any(|update| {
            matches!(&update, PipelineUpdate::ImageAnalysis(text) if text == "two slabs in a box")
        });
        assert!(saw_analysis);
        assert!(event_types(&events_path).contains(&"image_analyzed".to_string()));
        Ok(())
    }

    #[test]
    fn missing_vision_credential_blocks_image_runs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let sketch = temp.path().join("sketch.png");
        fs::write(&sketch, [0x89, 0x50, 0x4e, 0x47])?;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut providers = ChatProviderRegistry::new();
        providers.register(ScriptedProvider::new(&["unused"], Arc::clone(&calls)));
        // DeepSeek key present, DashScope key absent: the vision stage would
        // need DashScope, so the entry guard must reject before any call.
        let config = EngineConfig::new(
            temp.path(),
            Credentials::new(Some("sk-test".to_string()), None),
        )
        .with_documentation("DOC");
        let engine =
            ScriptEngine::with_providers(config, temp.path().join("events.jsonl"), providers)?;

        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "go".to_string(),
            image_path: Some(sketch),
            model: None,
        };
        let err = engine.run(&request, &token, None).expect_err("no DashScope key");
        assert!(matches!(
            err,
            PipelineError::MissingCredential {
                provider: "DashScope",
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn vision_with_missing_image_fails_before_writes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = scripted_engine(
            temp.path(),
            &temp.path().join("events.jsonl"),
            &["unused"],
            Arc::clone(&calls),
        );

        let token = RunCoordinator::new().begin();
        let request = GenerationRequest {
            user_text: "go".to_string(),
            image_path: Some(PathBuf::from("/no/such/sketch.png")),
            model: None,
        };
        let err = engine.run(&request, &token, None).expect_err("missing sketch");
        assert!(matches!(err, PipelineError::FileNotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
