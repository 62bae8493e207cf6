use std::path::Path;

use anyhow::{Context, Error, Result};
use candle_core::{Device, Tensor};
use candle_transformers::models::stable_diffusion::clip;
use tokenizers::Tokenizer;

/// A tokenizer that always yields exactly `max_len` ids.
///
/// Longer prompts are truncated (keeping a trailing special token such as
/// CLIP's end-of-text marker), shorter ones are padded with `pad_id`.
#[derive(Clone)]
pub struct PromptTokenizer {
    tokenizer: Tokenizer,
    max_len: usize,
    pad_id: u32,
}

impl PromptTokenizer {
    pub fn new(tokenizer: Tokenizer, max_len: usize, pad_token: &str) -> Result<Self> {
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("pad token {pad_token:?} is not in the vocabulary"))?;
        Ok(Self {
            tokenizer,
            max_len,
            pad_id,
        })
    }

    /// Pads the way the given CLIP text encoder was trained.
    pub fn for_clip(tokenizer: Tokenizer, config: &clip::Config) -> Result<Self> {
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        Self::new(tokenizer, config.max_position_embeddings, pad_token)
    }

    pub fn from_file(path: impl AsRef<Path>, config: &clip::Config) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(Error::msg)
            .with_context(|| format!("failed to load tokenizer {}", path.display()))?;
        Self::for_clip(tokenizer, config)
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, true).map_err(Error::msg)?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() > self.max_len {
            let ends_with_special = encoding.get_special_tokens_mask().last() == Some(&1);
            let last = ids[ids.len() - 1];
            ids.truncate(self.max_len);
            if ends_with_special {
                ids[self.max_len - 1] = last;
            }
        }
        ids.resize(self.max_len, self.pad_id);
        Ok(ids)
    }

    /// Token ids as a (1, max_len) u32 tensor.
    pub fn encode(&self, text: &str, device: &Device) -> Result<Tensor> {
        let ids = self.encode_ids(text)?;
        Ok(Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.tokenizer
            .save(path.as_ref(), false)
            .map_err(Error::msg)
            .with_context(|| format!("failed to save tokenizer to {}", path.as_ref().display()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::str::FromStr;

    /// Whitespace word-level tokenizer over a handful of clothing words.
    pub(crate) fn word_tokenizer(max_len: usize) -> PromptTokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {
                    "[UNK]": 0, "<pad>": 1, "black": 2, "boxer": 3,
                    "briefs": 4, "red": 5, "dress": 6, "denim": 7, "jacket": 8
                },
                "unk_token": "[UNK]"
            }
        }"#;
        let tokenizer = Tokenizer::from_str(json).unwrap();
        PromptTokenizer::new(tokenizer, max_len, "<pad>").unwrap()
    }

    #[test]
    fn pads_short_prompts() {
        let tok = word_tokenizer(6);
        assert_eq!(tok.encode_ids("black boxer briefs").unwrap(), vec![2, 3, 4, 1, 1, 1]);
    }

    #[test]
    fn truncates_long_prompts() {
        let tok = word_tokenizer(2);
        assert_eq!(tok.encode_ids("red denim jacket").unwrap(), vec![5, 7]);
        let t = tok.encode("red denim jacket", &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 2]);
    }

    #[test]
    fn unknown_pad_token_is_an_error() {
        let tok = word_tokenizer(4);
        assert!(PromptTokenizer::new(tok.tokenizer, 4, "<|endoftext|>").is_err());
    }
}
