//! Static model capability tables
//!
//! Lookup order: exact id, then the longest listed family that prefixes the
//! id at a separator (`claude-3-7-sonnet-latest` → `claude-3-7-sonnet`,
//! `gpt-4.5-preview` → `gpt-4`), then the provider-wide fallback.

/// Context and output limits for one model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub context_window: u32,
    pub max_output_tokens: u32,
}

impl ModelSpec {
    pub const fn new(context_window: u32, max_output_tokens: u32) -> Self {
        Self {
            context_window,
            max_output_tokens,
        }
    }

    /// Output cap for a prompt of `prompt_tokens`: never past the context
    /// window, never below one token.
    pub fn output_budget(&self, prompt_tokens: u64) -> u32 {
        let room = u64::from(self.context_window).saturating_sub(prompt_tokens);
        room.min(u64::from(self.max_output_tokens)).max(1) as u32
    }
}

/// How a model id was resolved against a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMatch {
    Exact(&'static str),
    Family(&'static str),
    Fallback,
}

/// Per-provider table of known models
#[derive(Debug)]
pub struct ModelTable {
    entries: &'static [(&'static str, ModelSpec)],
    fallback: ModelSpec,
}

const SEPARATORS: [char; 4] = ['-', '.', ':', '@'];

impl ModelTable {
    pub const fn new(entries: &'static [(&'static str, ModelSpec)], fallback: ModelSpec) -> Self {
        Self { entries, fallback }
    }

    /// Find the table entry a model id resolves to.
    pub fn lookup(&self, model: &str) -> ModelMatch {
        let model = model.trim();
        if let Some((id, _)) = self.entries.iter().find(|(id, _)| *id == model) {
            return ModelMatch::Exact(*id);
        }
        self.entries
            .iter()
            .filter(|(id, _)| {
                model
                    .strip_prefix(id)
                    .and_then(|rest| rest.chars().next())
                    .is_some_and(|c| SEPARATORS.contains(&c))
            })
            .max_by_key(|(id, _)| id.len())
            .map(|(id, _)| ModelMatch::Family(*id))
            .unwrap_or(ModelMatch::Fallback)
    }

    /// Capabilities for a model id; never fails.
    pub fn resolve(&self, model: &str) -> ModelSpec {
        match self.lookup(model) {
            ModelMatch::Exact(id) | ModelMatch::Family(id) => self
                .entries
                .iter()
                .find(|(entry, _)| *entry == id)
                .map(|(_, spec)| *spec)
                .unwrap_or(self.fallback),
            ModelMatch::Fallback => self.fallback,
        }
    }

    pub fn fallback(&self) -> ModelSpec {
        self.fallback
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &'static str> {
        self.entries.iter().map(|(id, _)| *id)
    }
}

pub static ANTHROPIC_MODELS: ModelTable = ModelTable::new(
    &[
        ("claude-opus-4-1", ModelSpec::new(200_000, 32_000)),
        ("claude-opus-4", ModelSpec::new(200_000, 32_000)),
        ("claude-sonnet-4", ModelSpec::new(200_000, 64_000)),
        ("claude-3-7-sonnet-20250219", ModelSpec::new(200_000, 64_000)),
        ("claude-3-7-sonnet", ModelSpec::new(200_000, 64_000)),
        ("claude-3-5-sonnet", ModelSpec::new(200_000, 8_192)),
        ("claude-3-5-haiku", ModelSpec::new(200_000, 8_192)),
        ("claude-3-opus", ModelSpec::new(200_000, 4_096)),
        ("claude-3-haiku", ModelSpec::new(200_000, 4_096)),
    ],
    ModelSpec::new(200_000, 4_096),
);

pub static OPENAI_MODELS: ModelTable = ModelTable::new(
    &[
        ("gpt-4o", ModelSpec::new(128_000, 16_384)),
        ("gpt-4o-mini", ModelSpec::new(128_000, 16_384)),
        ("gpt-4.1", ModelSpec::new(1_047_576, 32_768)),
        ("gpt-4.1-mini", ModelSpec::new(1_047_576, 32_768)),
        ("gpt-4.1-nano", ModelSpec::new(1_047_576, 32_768)),
        ("gpt-4-turbo", ModelSpec::new(128_000, 4_096)),
        ("gpt-4", ModelSpec::new(8_192, 4_096)),
        ("gpt-3.5-turbo", ModelSpec::new(16_385, 4_096)),
        ("o1", ModelSpec::new(200_000, 100_000)),
        ("o3-mini", ModelSpec::new(200_000, 100_000)),
        ("o4-mini", ModelSpec::new(200_000, 100_000)),
    ],
    ModelSpec::new(128_000, 4_096),
);

pub static GOOGLE_MODELS: ModelTable = ModelTable::new(
    &[
        ("gemini-2.5-pro", ModelSpec::new(1_048_576, 65_536)),
        ("gemini-2.5-flash", ModelSpec::new(1_048_576, 65_536)),
        ("gemini-2.0-flash", ModelSpec::new(1_048_576, 8_192)),
        ("gemini-1.5-pro", ModelSpec::new(2_097_152, 8_192)),
        ("gemini-1.5-flash", ModelSpec::new(1_048_576, 8_192)),
    ],
    ModelSpec::new(1_048_576, 8_192),
);
