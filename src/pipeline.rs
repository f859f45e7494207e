use crate::codec::AudioCodec;
use crate::envelope::{Catalog, ChatEnvelope};
use crate::error::RelayError;
use crate::speech::{SpeechRecognizer, SpeechSynthesizer};
use crate::staging::{StagedFile, StagingArea};
use crate::translator::TextTranslator;
use std::sync::Arc;

/// Translates one envelope in place.
///
/// Text: translate `FromText`, synthesize the translation.
/// Audio: decode `FromAudio`, normalize it, recognize it into `FromText`,
/// then continue as text. Either way `ToAudioUrl` points at the synthesized
/// result and `FromAudio` is cleared. Any failing step aborts the rest and the
/// envelope must not be forwarded.
///
/// The result file comes back still guarded: the caller persists it once the
/// envelope has been delivered, dropping it removes the file.
pub struct TranslationPipeline {
    translator: Arc<dyn TextTranslator>,
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    codec: Arc<dyn AudioCodec>,
    staging: StagingArea,
}

impl TranslationPipeline {
    pub fn new(
        translator: Arc<dyn TextTranslator>,
        recognizer: Arc<dyn SpeechRecognizer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        codec: Arc<dyn AudioCodec>,
        staging: StagingArea,
    ) -> Self {
        Self {
            translator,
            recognizer,
            synthesizer,
            codec,
            staging,
        }
    }

    pub async fn run(&self, envelope: &mut ChatEnvelope) -> Result<StagedFile, RelayError> {
        envelope.validate()?;
        let workspace = self.staging.open(envelope).await?;
        log::debug!("Processing {} as {}", envelope.describe(), workspace.stem());

        if envelope.catalog == Catalog::Audio {
            // 语音消息：先解码、转格式、识别成文字
            let raw = envelope.decode_audio()?;
            let uploaded = workspace.stage("_cvtbef", "amr");
            tokio::fs::write(uploaded.path(), &raw).await?;

            let normalized = workspace.stage("", "amr");
            self.codec.normalize(uploaded.path(), normalized.path()).await?;
            envelope.from_text = self.recognizer.recognize(normalized.path()).await?;
        }

        envelope.to_text = self
            .translator
            .translate(&envelope.from_lang, &envelope.to_lang, &envelope.from_text)
            .await?;

        let result = workspace.stage("_result", "amr");
        self.synthesizer.synthesize(&envelope.to_text, result.path()).await?;
        envelope.to_audio_url = workspace.download_url(&result);
        envelope.from_audio.clear();
        Ok(result)
    }
}
