//! Prompt templates per analysis type.
//!
//! The type tag is a closed enum with a `custom` escape hatch; any string the
//! deserializer does not recognize lands on `custom` instead of erroring, so
//! new client-side types degrade to the generic pipeline.

use serde::{Deserialize, Serialize};

use crate::registry::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Document,
    Chat,
    Seo,
    Crypto,
    #[serde(other)]
    Custom,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 5] = [
        AnalysisType::Document,
        AnalysisType::Chat,
        AnalysisType::Seo,
        AnalysisType::Crypto,
        AnalysisType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Document => "document",
            AnalysisType::Chat => "chat",
            AnalysisType::Seo => "seo",
            AnalysisType::Crypto => "crypto",
            AnalysisType::Custom => "custom",
        }
    }

    /// The capability an analyzer should advertise to serve this type.
    pub fn capability(&self) -> Capability {
        match self {
            AnalysisType::Document => Capability::DocumentAnalysis,
            AnalysisType::Chat => Capability::ChatProcessing,
            AnalysisType::Seo => Capability::SeoGeneration,
            AnalysisType::Crypto => Capability::CryptoAnalysis,
            AnalysisType::Custom => Capability::GenericAnalysis,
        }
    }
}

impl std::fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct PromptPair {
    pub system: &'static str,
    pub user_template: &'static str,
}

const DOCUMENT: PromptPair = PromptPair {
    system: "You are an expert prompt engineer for document analysis. \
Rewrite the user's request into a precise analysis prompt that asks for an \
executive summary, the key insights with supporting evidence, and concrete \
recommendations. When the request omits length or focus, default to a medium \
summary focused on the main points. Return only the rewritten prompt.",
    user_template: "Rewrite this document analysis request into an optimized prompt:\n\n{input}",
};

const CHAT: PromptPair = PromptPair {
    system: "You are an expert prompt engineer for conversational AI. \
Rewrite the user's message into a prompt that captures intent, desired tone, \
and context, and asks for a helpful, naturally phrased reply with sensible \
follow-ups. Default to a professional, friendly tone. Return only the \
rewritten prompt.",
    user_template: "Rewrite this conversational request into an optimized prompt:\n\n{input}",
};

const SEO: PromptPair = PromptPair {
    system: "You are an expert prompt engineer for SEO content. Rewrite the \
user's request into a prompt that asks for a keyword-optimized title and meta \
description, a header structure, natural keyword usage, and a closing call to \
action. Default to a blog post of 800-1200 words when unspecified. Return \
only the rewritten prompt.",
    user_template: "Rewrite this content request into an SEO-optimized prompt:\n\n{input}",
};

const CRYPTO: PromptPair = PromptPair {
    system: "You are an expert prompt engineer for market analysis. Rewrite \
the user's request into a prompt that asks for social sentiment, a recent \
news summary, a market snapshot with price and volume, a buy/sell/hold view, \
and a 1-10 risk score. Default to a 7-day window when none is given. Return \
only the rewritten prompt.",
    user_template: "Rewrite this market analysis request into an optimized prompt:\n\n{input}",
};

const CUSTOM: PromptPair = PromptPair {
    system: "You are an expert prompt engineer. Extract the requirements, \
constraints and desired outcome from the user's request, fill obvious gaps \
with sensible defaults, and produce a single clear prompt structured for a \
high-quality answer. Return only the rewritten prompt.",
    user_template: "Rewrite this request into an optimized prompt:\n\n{input}",
};

const ANALYZER_SYSTEM: &str = "You are a senior analyst. Follow the \
instructions in the prompt exactly and answer with a complete, well \
structured result.";

pub fn prompt_for(analysis_type: AnalysisType) -> &'static PromptPair {
    match analysis_type {
        AnalysisType::Document => &DOCUMENT,
        AnalysisType::Chat => &CHAT,
        AnalysisType::Seo => &SEO,
        AnalysisType::Crypto => &CRYPTO,
        AnalysisType::Custom => &CUSTOM,
    }
}

/// System prompt handed to the stage-2 analyzer.
pub fn analyzer_system_prompt() -> &'static str {
    ANALYZER_SYSTEM
}

pub fn render_user_prompt(analysis_type: AnalysisType, input: &str) -> String {
    prompt_for(analysis_type)
        .user_template
        .replace("{input}", input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_has_nonempty_templates() {
        for t in AnalysisType::ALL {
            let pair = prompt_for(t);
            assert!(!pair.system.trim().is_empty(), "{t} system prompt empty");
            assert!(
                pair.user_template.contains("{input}"),
                "{t} user template must embed the input"
            );
        }
    }

    #[test]
    fn rendering_substitutes_the_input() {
        let rendered = render_user_prompt(AnalysisType::Document, "summarize the Q3 report");
        assert!(rendered.contains("summarize the Q3 report"));
        assert!(!rendered.contains("{input}"));
    }

    #[test]
    fn known_tags_round_trip_through_serde() {
        for (tag, expected) in [
            ("\"document\"", AnalysisType::Document),
            ("\"chat\"", AnalysisType::Chat),
            ("\"seo\"", AnalysisType::Seo),
            ("\"crypto\"", AnalysisType::Crypto),
            ("\"custom\"", AnalysisType::Custom),
        ] {
            let parsed: AnalysisType = serde_json::from_str(tag).unwrap();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn unknown_tags_fall_back_to_custom() {
        let parsed: AnalysisType = serde_json::from_str("\"sentiment\"").unwrap();
        assert_eq!(parsed, AnalysisType::Custom);
    }
}
