//! Decoder and renderer that move payload bytes through unchanged. Used by
//! the CLI to exercise the pipeline without a codec, and by tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use media_types::Resolution;
use parking_lot::Mutex;

use super::{
    Compatibility, DecodedOutput, Decoder, DecoderFactory, DecoderInput, OutputBuffer,
    OutputStatus, RendererSink, SampleProperties, SubmitMode, SubmitStatus,
};
use crate::error::DecodeError;
use crate::unit::CodecConfiguration;

/// Emits every normally submitted unit's payload as its decoded output, in
/// submission order.
#[derive(Debug)]
pub struct PassthroughDecoder {
    config: CodecConfiguration,
    queued: VecDeque<DecodedOutput>,
    end_of_input: bool,
}

impl PassthroughDecoder {
    pub fn new(config: &CodecConfiguration) -> Self {
        Self {
            config: config.clone(),
            queued: VecDeque::new(),
            end_of_input: false,
        }
    }
}

impl Decoder for PassthroughDecoder {
    fn submit(&mut self, input: DecoderInput<'_>) -> SubmitStatus {
        if self.end_of_input {
            return SubmitStatus::EndOfData;
        }
        if input.mode == SubmitMode::Normal {
            let resolution = input
                .unit
                .codec_config
                .as_ref()
                .and_then(|c| c.resolution)
                .or(self.config.resolution);
            self.queued.push_back(DecodedOutput {
                correlation: input.correlation,
                data: input.unit.payload.clone(),
                resolution,
            });
        }
        SubmitStatus::Accepted
    }

    fn send_end_of_input(&mut self) -> SubmitStatus {
        self.end_of_input = true;
        SubmitStatus::Accepted
    }

    fn request_output(&mut self) -> Result<OutputStatus, DecodeError> {
        if let Some(output) = self.queued.pop_front() {
            return Ok(OutputStatus::Available(output));
        }
        if self.end_of_input {
            return Ok(OutputStatus::EndOfData);
        }
        Ok(OutputStatus::TryAgain)
    }

    fn flush(&mut self) {
        self.queued.clear();
        self.end_of_input = false;
    }

    fn reset_to_clean_start(&mut self) -> bool {
        self.flush();
        true
    }

    fn is_compatible_with(&self, config: &CodecConfiguration) -> Compatibility {
        if config.decoder_specific != self.config.decoder_specific {
            Compatibility::DrainAndReset
        } else if config.resolution != self.config.resolution {
            Compatibility::Drain
        } else {
            Compatibility::Compatible
        }
    }
}

/// Creates [`PassthroughDecoder`]s and counts how many were made.
#[derive(Debug, Default, Clone)]
pub struct PassthroughFactory {
    created: Arc<AtomicUsize>,
}

impl PassthroughFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl DecoderFactory for PassthroughFactory {
    fn create(&mut self, config: &CodecConfiguration) -> Result<Box<dyn Decoder>, DecodeError> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(PassthroughDecoder::new(config)))
    }
}

/// What a [`CollectingRenderer`] received for one returned buffer.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub properties: SampleProperties,
    pub presentable: bool,
    pub size: usize,
    pub resolution: Option<Resolution>,
}

/// Records every returned buffer. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct CollectingRenderer {
    frames: Arc<Mutex<Vec<RenderedFrame>>>,
    next_id: u64,
    /// Maximum number of frames accepted; `None` is unbounded
    capacity: Option<usize>,
}

impl CollectingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A renderer that stops handing out buffers after `capacity` frames.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<RenderedFrame> {
        self.frames.lock().clone()
    }

    /// Frames shown to the viewer; filler dummies are not counted.
    pub fn presented(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|f| f.presentable && !f.properties.dummy)
            .count()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|cap| self.frames.lock().len() >= cap)
    }
}

impl RendererSink for CollectingRenderer {
    fn can_receive_frames(&self, _count: usize) -> bool {
        !self.is_full()
    }

    fn acquire_output_buffer(&mut self) -> Result<Option<OutputBuffer>, DecodeError> {
        if self.is_full() {
            return Ok(None);
        }
        self.next_id += 1;
        Ok(Some(OutputBuffer {
            id: self.next_id,
            ..OutputBuffer::default()
        }))
    }

    fn return_buffer(
        &mut self,
        buffer: OutputBuffer,
        presentable: bool,
        properties: SampleProperties,
    ) -> Result<(), DecodeError> {
        let resolution = properties.resolution;
        self.frames.lock().push(RenderedFrame {
            properties,
            presentable,
            size: buffer.data.len(),
            resolution,
        });
        Ok(())
    }
}
