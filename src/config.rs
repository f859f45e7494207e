use anyhow::Context;
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub nsq: NsqConfig,
    pub credential: CredentialConfig,
    pub translate: TranslateConfig,
    pub speech: SpeechConfig,
    pub codec: CodecConfig,
    pub staging: StagingConfig,
    pub http: HttpConfig,
}

// 消息队列配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NsqConfig {
    pub nsqd_address: String,
    /// nsqlookupd HTTP address, e.g. `127.0.0.1:4161`. When set the consumer
    /// asks it for a producer of `inbound_topic` instead of using `nsqd_address`.
    pub lookupd_http_address: Option<String>,
    pub inbound_topic: String,
    pub channel: String,
    pub outbound_topic: String,
    /// RDY count sent after SUB
    pub max_in_flight: u32,
    /// Deliveries beyond this count are dropped instead of requeued
    pub max_attempts: u16,
    pub requeue_delay_ms: u64,
    pub reconnect_max_secs: u64,
    /// TOUCH period for messages still being processed, below nsqd's msg_timeout (60s by default)
    pub touch_interval_secs: u64,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            nsqd_address: "127.0.0.1:4150".to_string(),
            lookupd_http_address: None,
            inbound_topic: "translateBefore".to_string(),
            channel: "channelA".to_string(),
            outbound_topic: "translateAfter".to_string(),
            max_in_flight: 1,
            max_attempts: 5,
            requeue_delay_ms: 5000,
            reconnect_max_secs: 60,
            touch_interval_secs: 30,
        }
    }
}

impl NsqConfig {
    pub fn touch_interval(&self) -> Duration {
        Duration::from_secs(self.touch_interval_secs)
    }

    pub fn lookup_url(&self) -> Option<String> {
        self.lookupd_http_address.as_ref().map(|addr| {
            let base = if addr.starts_with("http://") || addr.starts_with("https://") {
                addr.trim_end_matches('/').to_string()
            } else {
                format!("http://{}", addr.trim_end_matches('/'))
            };
            format!("{}/lookup", base)
        })
    }
}

// 语音服务 Access Token 配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CredentialConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub persist_path: PathBuf,
    pub refresh_interval_secs: u64,
    pub retry_initial_secs: u64,
    pub retry_max_secs: u64,
    pub timeout_ms: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            token_url: "https://openapi.baidu.com/oauth/2.0/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            persist_path: PathBuf::from("/tmp/translatechat/token"),
            refresh_interval_secs: 20 * 24 * 3600,
            retry_initial_secs: 5,
            retry_max_secs: 300,
            timeout_ms: 10_000,
        }
    }
}

impl CredentialConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

// 文本翻译配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TranslateConfig {
    pub url: String,
    pub app_id: String,
    pub secret_key: String,
    pub timeout_ms: u64,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            url: "http://api.fanyi.baidu.com/api/trans/vip/translate".to_string(),
            app_id: String::new(),
            secret_key: String::new(),
            timeout_ms: 10_000,
        }
    }
}

// 语音识别 / 语音合成配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SpeechConfig {
    pub asr_url: String,
    pub tts_url: String,
    /// Sent as `cuid`, identifies this client to the provider
    pub client_id: String,
    pub asr_lang: String,
    pub asr_content_type: String,
    pub tts_lang: String,
    /// Provider audio encoding code, 3 = mp3
    pub tts_format: String,
    pub timeout_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            asr_url: "http://vop.baidu.com/server_api".to_string(),
            tts_url: "http://tsn.baidu.com/text2audio".to_string(),
            client_id: "TranslateChat".to_string(),
            asr_lang: "zh".to_string(),
            asr_content_type: "audio/amr;rate=16000".to_string(),
            tts_lang: "zh".to_string(),
            tts_format: "3".to_string(),
            timeout_ms: 15_000,
        }
    }
}

/// An external program invocation. `{input}` and `{output}` in `args` are
/// replaced with the staged file paths.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    fn ffmpeg_amr_wb() -> Self {
        let args = [
            "-y", "-i", "{input}", "-acodec", "amr_wb", "-ac", "1", "-ar", "16000", "-ab",
            "23850", "{output}",
        ];
        Self {
            program: "ffmpeg".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

// 音频格式转换配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CodecConfig {
    pub timeout_ms: u64,
    /// Uploaded audio -> format accepted by speech recognition
    pub normalize: CommandSpec,
    /// Synthesized speech -> format handed back to clients
    pub encode_result: CommandSpec,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            normalize: CommandSpec::ffmpeg_amr_wb(),
            encode_result: CommandSpec::ffmpeg_amr_wb(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StagingConfig {
    pub upload_root: PathBuf,
    pub download_prefix: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from("upload"),
            download_prefix: "download".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:3389".to_string(),
        }
    }
}

impl Config {
    /// Loads `path` (optional) and overlays `RELAY__SECTION__KEY` environment variables.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, name) in [
            ("nsq.inbound_topic", &self.nsq.inbound_topic),
            ("nsq.channel", &self.nsq.channel),
            ("nsq.outbound_topic", &self.nsq.outbound_topic),
        ] {
            if !crate::nsq::is_valid_name(name) {
                anyhow::bail!("invalid value for {}: {:?}", field, name);
            }
        }
        if self.nsq.max_in_flight == 0 {
            anyhow::bail!("nsq.max_in_flight must be at least 1");
        }
        if self.nsq.max_attempts == 0 {
            anyhow::bail!("nsq.max_attempts must be at least 1");
        }
        for (field, value) in [
            ("nsq.touch_interval_secs", self.nsq.touch_interval_secs),
            ("credential.timeout_ms", self.credential.timeout_ms),
            ("credential.refresh_interval_secs", self.credential.refresh_interval_secs),
            ("credential.retry_initial_secs", self.credential.retry_initial_secs),
            ("translate.timeout_ms", self.translate.timeout_ms),
            ("speech.timeout_ms", self.speech.timeout_ms),
            ("codec.timeout_ms", self.codec.timeout_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", field);
            }
        }
        for (field, value) in [
            ("credential.token_url", &self.credential.token_url),
            ("translate.url", &self.translate.url),
            ("speech.asr_url", &self.speech.asr_url),
            ("speech.tts_url", &self.speech.tts_url),
        ] {
            url::Url::parse(value).with_context(|| format!("invalid value for {}: {:?}", field, value))?;
        }
        if let Some(lookup) = self.nsq.lookup_url() {
            url::Url::parse(&lookup)
                .with_context(|| format!("invalid value for nsq.lookupd_http_address: {:?}", lookup))?;
        }
        if self.credential.retry_max_secs < self.credential.retry_initial_secs {
            anyhow::bail!("credential.retry_max_secs is smaller than retry_initial_secs");
        }
        Ok(())
    }
}
