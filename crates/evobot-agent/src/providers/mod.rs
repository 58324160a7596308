// ABOUTME: Provider module aggregating the synthesis adapters.
// ABOUTME: Each sub-module implements Synthesizer for a specific LLM API.

pub mod openai;

pub use openai::OpenAiSynthesizer;
