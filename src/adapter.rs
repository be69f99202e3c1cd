//! The backend boundary: input envelopes, type adapters and greedy generation over a
//! [`SteerableModel`].
//!
//! A backend that exposes a per-step logits hook uses [`LogitsTypeAdapter`] (or
//! [`VisionTypeAdapter`] for prompt and image pairs) and receives a [`LogitsProcessor`]. A
//! backend that only accepts a JSON schema uses [`SchemaOnlyTypeAdapter`].
use std::io;
use std::sync::Arc;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;

use crate::config::Config;
use crate::processor::{CreateProcessorError, LogitsProcessor};
use crate::processor_like::{AcceptTokenError, AcceptTokenResult, MaskLogitsError, ProcessorLike};
use crate::types::{self, OutputTypeSpec, TypeDescriptor, UnsupportedTypeError};
use crate::vocabulary::Vocabulary;

/// The input a user passes to a model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput<I> {
    /// A single prompt.
    Text(String),
    /// Several prompts, generated as one batch.
    TextBatch(Vec<String>),
    /// Prompts paired with images.
    Vision(VisionInput<I>),
}

impl<I> ModelInput<I> {
    /// A short name of the input kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelInput::Text(_) => "text",
            ModelInput::TextBatch(_) => "text batch",
            ModelInput::Vision(_) => "vision",
        }
    }
}

/// Prompts paired with images of type `I`.
#[derive(Debug, Clone, PartialEq)]
pub enum VisionInput<I> {
    /// One prompt and one image.
    Single {
        /// The prompt.
        prompt: String,
        /// The image.
        image: I,
    },
    /// A list of prompts and a list of images of the same length.
    Batch {
        /// The prompts.
        prompts: Vec<String>,
        /// The images.
        images: Vec<I>,
    },
}

impl<I> VisionInput<I> {
    /// One prompt and one image.
    pub fn single(prompt: impl Into<String>, image: I) -> Self {
        VisionInput::Single {
            prompt: prompt.into(),
            image,
        }
    }

    /// A batch of prompts and images.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::LengthMismatch`] when the lists differ in length.
    pub fn batch(prompts: Vec<String>, images: Vec<I>) -> Result<Self, InputError> {
        let input = VisionInput::Batch { prompts, images };
        input.validate()?;
        Ok(input)
    }

    fn validate(&self) -> Result<(), InputError> {
        match self {
            VisionInput::Batch { prompts, images } if prompts.len() != images.len() => {
                Err(InputError::LengthMismatch {
                    prompts: prompts.len(),
                    images: images.len(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// The prompts of a text input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompts {
    /// A single prompt.
    Single(String),
    /// A batch of prompts.
    Batch(Vec<String>),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
/// The error type for malformed or unsupported model inputs.
pub enum InputError {
    /// The adapter does not handle this kind of input.
    #[error(
        "The input type `{0}` is not available. Please provide a prompt or a list of prompts \
        and an image or a list of images. The number of prompts must match the number of images."
    )]
    Unsupported(&'static str),
    /// A vision batch has differing numbers of prompts and images.
    #[error("The number of prompts must match the number of images: got {prompts} prompts and {images} images.")]
    LengthMismatch {
        /// The number of prompts.
        prompts: usize,
        /// The number of images.
        images: usize,
    },
}

#[derive(Debug, thiserror::Error)]
/// The error type for output type formatting.
pub enum AdapterError {
    /// The backend needs an output type.
    #[error("You must provide an output type. This backend only supports structured generation.")]
    MissingOutputType,
    /// The output type has no JSON schema form.
    #[error("The type `{0}` is not supported. Please use a JSON schema or a type that can be converted to one.")]
    UnsupportedOutputType(String),
    /// Regular expressions cannot be delegated to the backend.
    #[error("Regex-based structured outputs will soon be available with this backend. Please use a JSON schema for now.")]
    RegexNotAvailable,
    /// Grammars cannot be delegated to the backend.
    #[error("CFG-based structured outputs will soon be available with this backend. Please use a JSON schema for now.")]
    CfgNotAvailable,
    #[error("{0}")]
    /// A wrapper for the [`UnsupportedTypeError`] error type.
    UnsupportedType(#[from] UnsupportedTypeError),
    #[error("{0}")]
    /// A wrapper for the [`CreateProcessorError`] error type.
    Processor(#[from] CreateProcessorError),
    #[error("Invalid JSON schema: {0}")]
    /// A JSON schema given as text does not parse.
    Json(#[from] serde_json::Error),
}

/// Turns user inputs and output types into what a backend consumes.
pub trait TypeAdapter<I> {
    /// The formatted input.
    type Input;
    /// The formatted output constraint.
    type OutputType;

    /// Formats the user input.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for input kinds the backend does not handle.
    fn format_input(&self, input: ModelInput<I>) -> Result<Self::Input, InputError>;

    /// Formats the output type, `None` meaning unconstrained generation.
    ///
    /// # Errors
    ///
    /// Returns an [`AdapterError`] when the output type cannot be expressed for the backend.
    fn format_output_type(
        &self,
        output_type: Option<&TypeDescriptor>,
    ) -> Result<Self::OutputType, AdapterError>;
}

/// The adapter of text backends with a logits hook.
#[derive(Debug, Clone)]
pub struct LogitsTypeAdapter {
    vocabulary: Arc<Vocabulary>,
    config: Config,
}

impl LogitsTypeAdapter {
    /// Creates an adapter for a backend with the given vocabulary.
    pub fn new(vocabulary: Arc<Vocabulary>, config: Config) -> Self {
        Self { vocabulary, config }
    }

    fn processor(
        &self,
        output_type: Option<&TypeDescriptor>,
    ) -> Result<Option<LogitsProcessor>, AdapterError> {
        output_type
            .map(|ty| LogitsProcessor::with_config(ty, self.vocabulary.clone(), &self.config))
            .transpose()
            .map_err(AdapterError::from)
    }
}

impl<I> TypeAdapter<I> for LogitsTypeAdapter {
    type Input = Prompts;
    type OutputType = Option<LogitsProcessor>;

    fn format_input(&self, input: ModelInput<I>) -> Result<Prompts, InputError> {
        match input {
            ModelInput::Text(prompt) => Ok(Prompts::Single(prompt)),
            ModelInput::TextBatch(prompts) => Ok(Prompts::Batch(prompts)),
            other => Err(InputError::Unsupported(other.kind())),
        }
    }

    fn format_output_type(
        &self,
        output_type: Option<&TypeDescriptor>,
    ) -> Result<Option<LogitsProcessor>, AdapterError> {
        self.processor(output_type)
    }
}

/// The adapter of vision backends with a logits hook.
#[derive(Debug, Clone)]
pub struct VisionTypeAdapter {
    inner: LogitsTypeAdapter,
}

impl VisionTypeAdapter {
    /// Creates an adapter for a backend with the given vocabulary.
    pub fn new(vocabulary: Arc<Vocabulary>, config: Config) -> Self {
        Self {
            inner: LogitsTypeAdapter::new(vocabulary, config),
        }
    }
}

impl<I> TypeAdapter<I> for VisionTypeAdapter {
    type Input = VisionInput<I>;
    type OutputType = Option<LogitsProcessor>;

    fn format_input(&self, input: ModelInput<I>) -> Result<VisionInput<I>, InputError> {
        match input {
            ModelInput::Vision(vision) => {
                vision.validate()?;
                Ok(vision)
            }
            other => Err(InputError::Unsupported(other.kind())),
        }
    }

    fn format_output_type(
        &self,
        output_type: Option<&TypeDescriptor>,
    ) -> Result<Option<LogitsProcessor>, AdapterError> {
        self.inner.processor(output_type)
    }
}

/// The adapter of backends that take a JSON schema instead of a logits hook.
///
/// Only output types with a JSON schema form are accepted. The schema is sent on one line with
/// `, ` and `: ` separators and non-ASCII characters escaped, the form schema-only backends
/// conventionally receive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaOnlyTypeAdapter;

impl<I> TypeAdapter<I> for SchemaOnlyTypeAdapter {
    type Input = String;
    type OutputType = String;

    fn format_input(&self, input: ModelInput<I>) -> Result<String, InputError> {
        match input {
            ModelInput::Text(prompt) => Ok(prompt),
            other => Err(InputError::Unsupported(other.kind())),
        }
    }

    fn format_output_type(
        &self,
        output_type: Option<&TypeDescriptor>,
    ) -> Result<String, AdapterError> {
        let ty = output_type.ok_or(AdapterError::MissingOutputType)?;
        let schema = match types::classify(ty)? {
            OutputTypeSpec::JsonSchema(Value::String(text)) => {
                serde_json::from_str::<Value>(&text)?
            }
            OutputTypeSpec::JsonSchema(schema) => schema,
            OutputTypeSpec::NativeStruct(s) => s.json_schema()?,
            OutputTypeSpec::Regex(_) => return Err(AdapterError::RegexNotAvailable),
            OutputTypeSpec::Cfg(_) => return Err(AdapterError::CfgNotAvailable),
            OutputTypeSpec::Primitive(_)
            | OutputTypeSpec::Enum(_)
            | OutputTypeSpec::Choice(_)
            | OutputTypeSpec::Automaton(_) => {
                return Err(AdapterError::UnsupportedOutputType(ty.to_string()))
            }
        };
        let mut buffer = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, SpacedFormatter);
        schema.serialize(&mut serializer)?;
        // Only ASCII is ever written.
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Single-line JSON with a space after every `,` and `:`.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
    ) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        for c in fragment.chars() {
            if matches!(c, ' '..='~') {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// A model that scores the next token.
pub trait SteerableModel {
    /// The backend error type.
    type Error: std::error::Error + 'static;

    /// The vocabulary of the model's tokenizer.
    fn vocabulary(&self) -> Arc<Vocabulary>;

    /// Tokenizes a prompt.
    fn encode(&self, prompt: &str) -> Result<Vec<u32>, Self::Error>;

    /// The logits of the token following `token_ids`. The vector may be longer than the vocabulary.
    fn next_token_logits(&mut self, token_ids: &[u32]) -> Result<Vec<f32>, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
/// The error type for [`generate`].
pub enum GenerateError<E: std::error::Error + 'static> {
    #[error("{0}")]
    /// The backend failed.
    Backend(E),
    #[error("Failed to mask the logits: {0}")]
    /// The processor could not mask the logits.
    Mask(MaskLogitsError),
    #[error("The selected token was not accepted: {0}")]
    /// The processor did not accept the selected token.
    Accept(AcceptTokenError),
    /// Every logit was negative infinity or NaN, so no token could be selected.
    #[error("No token can be selected at step {step}: every logit is negative infinity or NaN.")]
    NoSelectableToken {
        /// The zero-based index of the generation step.
        step: usize,
    },
}

/// The result of [`generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// The generated token IDs, EOS included if it was emitted.
    pub token_ids: Vec<u32>,
    /// The decoded text, EOS excluded.
    pub text: String,
}

fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &logit) in logits.iter().enumerate() {
        if logit == f32::NEG_INFINITY || logit.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| logit > b) {
            best = Some((i, logit));
        }
    }
    best.map(|(i, _)| i as u32)
}

/// Greedy decoding of up to `max_new_tokens` tokens, constrained by `processor` when given.
///
/// Generation stops at the EOS token, when the processor finishes, or when the token budget is
/// spent.
///
/// # Errors
///
/// Backend errors are returned unchanged as [`GenerateError::Backend`]. Processor failures are
/// invariant violations and are returned as [`GenerateError::Mask`] or [`GenerateError::Accept`].
/// Logits with no finite entry end generation with [`GenerateError::NoSelectableToken`].
pub fn generate<M: SteerableModel>(
    model: &mut M,
    prompt: &str,
    mut processor: Option<&mut LogitsProcessor>,
    max_new_tokens: usize,
) -> Result<Generation, GenerateError<M::Error>> {
    let vocabulary = model.vocabulary();
    let mut context = model.encode(prompt).map_err(GenerateError::Backend)?;
    let prompt_len = context.len();
    if let Some(processor) = processor.as_deref_mut() {
        processor.reset();
    }
    for step in 0..max_new_tokens {
        let mut logits = model
            .next_token_logits(&context)
            .map_err(GenerateError::Backend)?;
        if let Some(processor) = processor.as_deref_mut() {
            processor.compute_allowed_token_ids();
            processor.mask_logits(&mut logits).map_err(GenerateError::Mask)?;
        }
        let Some(token_id) = argmax(&logits) else {
            return Err(GenerateError::NoSelectableToken { step });
        };
        context.push(token_id);
        let finished = match processor.as_deref_mut() {
            Some(processor) => {
                processor.try_accept_new_token(token_id).map_err(GenerateError::Accept)?
                    == AcceptTokenResult::Finished
            }
            None => false,
        };
        if finished || Some(token_id) == vocabulary.eos_token_id() {
            break;
        }
    }
    let token_ids = context.split_off(prompt_len);
    let text = String::from_utf8_lossy(&vocabulary.decode(&token_ids)).into_owned();
    Ok(Generation { token_ids, text })
}
