use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use electra_engine::decode::{CollectingRenderer, EngineMetricsSnapshot, PassthroughFactory};
use electra_engine::demux::parser::{ContainerParser, SampleParser};
use electra_engine::demux::{
    ContainerFormat, DemuxEvent, FileTransport, PROBE_LEN, ResourceRequest, SegmentOutcome, SliceReader,
};
use electra_engine::{
    DecodeConfig, DecodeEngine, ElectraConfig, EngineExit, MediaTime, SegmentDemultiplexer, SegmentRequest,
    StreamType, TrackBufferManager,
};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

fn read_file(path: &Path) -> Result<Bytes> {
    fs::read(path)
        .map(Bytes::from)
        .map_err(|source| AppError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
}

fn probe_format(data: &[u8]) -> Option<ContainerFormat> {
    ContainerFormat::probe(&data[..data.len().min(PROBE_LEN)])
}

// --- probe ---

#[derive(Debug, Default)]
struct TrackSummary {
    samples: u64,
    sync_samples: u64,
    bytes: u64,
    first_pts: Option<MediaTime>,
    last_end: Option<MediaTime>,
}

pub fn probe(file: &Path, init: Option<&Path>, walk_samples: bool) -> Result<()> {
    let data = read_file(file)?;
    let init = init.map(read_file).transpose()?;

    // A bare media fragment is recognized by its init segment.
    let format = probe_format(&data)
        .or_else(|| init.as_deref().and_then(probe_format))
        .ok_or_else(|| AppError::InvalidInput(format!("{}: unrecognized container", file.display())))?;
    debug!(file = %file.display(), %format, "Probed container");

    let mut parser = ContainerParser::for_format(format);
    let mut reader = SliceReader::new(data.clone());
    let tracks = parser.parse_header(init.as_ref(), &mut reader)?;

    println!("{} ({} bytes): {}", file.display(), data.len(), format);
    for track in &tracks {
        let codec = &track.codec;
        let mut details = Vec::new();
        if let Some(resolution) = codec.resolution {
            details.push(resolution.to_string());
        }
        if let Some(rate) = codec.sample_rate {
            details.push(format!("{rate} Hz"));
        }
        if let Some(channels) = codec.channels {
            details.push(format!("{channels} ch"));
        }
        println!(
            "  track {:>5}  {:<8}  {:<6}  timescale {:>7}  {}",
            track.id,
            track.stream_type,
            codec.codec,
            track.timescale,
            details.join(", ")
        );
    }

    if !walk_samples {
        return Ok(());
    }

    let ids: Vec<u64> = tracks.iter().map(|t| t.id).collect();
    parser.select_tracks(&ids);
    let mut summaries: BTreeMap<u64, TrackSummary> = BTreeMap::new();
    while let Some(sample) = parser.next_sample(&mut reader)? {
        let Some(track) = tracks.iter().find(|t| t.id == sample.track_id) else {
            continue;
        };
        let pts = MediaTime::from_ticks(sample.pts, track.timescale);
        let end = MediaTime::from_ticks(sample.pts + sample.duration as i64, track.timescale);
        let summary = summaries.entry(track.id).or_default();
        summary.samples += 1;
        summary.sync_samples += u64::from(sample.sync);
        summary.bytes += sample.payload.len() as u64;
        summary.first_pts = Some(summary.first_pts.map_or(pts, |p| p.min(pts)));
        summary.last_end = Some(summary.last_end.map_or(end, |e| e.max(end)));
    }

    for (id, summary) in &summaries {
        let (first, last) = (
            summary.first_pts.unwrap_or_default(),
            summary.last_end.unwrap_or_default(),
        );
        println!(
            "  track {:>5}  {} samples ({} sync), {} bytes, {} .. {} ({})",
            id,
            summary.samples,
            summary.sync_samples,
            summary.bytes,
            first,
            last,
            last - first
        );
    }
    Ok(())
}

// --- play ---

#[derive(Debug, Clone)]
pub struct PlayOptions {
    pub files: Vec<PathBuf>,
    pub init: Option<PathBuf>,
    pub stream_type: StreamType,
    pub with_audio: bool,
    pub segment_duration: MediaTime,
    pub allow_missing: bool,
}

impl PlayOptions {
    fn stream_types(&self) -> Vec<StreamType> {
        let mut types = vec![self.stream_type];
        if self.with_audio && self.stream_type != StreamType::Audio {
            types.push(StreamType::Audio);
        }
        types
    }

    fn requests(&self) -> Vec<SegmentRequest> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, file)| {
                let start = MediaTime::from_hns(self.segment_duration.hns() * i as i64);
                let mut request = SegmentRequest::new(self.stream_type, file.to_string_lossy())
                    .with_timing(start, self.segment_duration)
                    .may_be_missing(self.allow_missing);
                if let Some(init) = &self.init {
                    request = request.with_init(ResourceRequest::new(init.to_string_lossy()));
                }
                request
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct PlaybackSummary {
    frames: usize,
    presented: usize,
    dummies: usize,
    first_pts: Option<MediaTime>,
    last_pts: Option<MediaTime>,
    engines: usize,
    metrics: Vec<EngineMetricsSnapshot>,
}

/// Runs engines for one stream type until end of data, replacing the engine
/// whenever the codec changes.
fn spawn_player(
    stream_type: StreamType,
    config: DecodeConfig,
    buffers: Arc<TrackBufferManager>,
) -> std::io::Result<JoinHandle<Result<PlaybackSummary>>> {
    thread::Builder::new()
        .name(format!("electra-play-{stream_type}"))
        .spawn(move || {
            let factory = PassthroughFactory::new();
            let renderer = CollectingRenderer::new();
            let mut summary = PlaybackSummary::default();
            let mut pending = None;
            loop {
                let mut engine = DecodeEngine::new(
                    stream_type,
                    &config,
                    Arc::clone(&buffers),
                    Box::new(factory.clone()),
                    Box::new(renderer.clone()),
                )
                .exit_on_end_of_data(true);
                if let Some(unit) = pending.take() {
                    engine = engine.with_initial_unit(unit);
                }
                let metrics = engine.metrics();
                summary.engines += 1;
                let exit = engine.run()?;
                summary.metrics.push(metrics.snapshot());
                match exit {
                    EngineExit::Terminated => break,
                    EngineExit::CodecChange { pending: unit } => {
                        info!(%stream_type, "Codec changed, starting a new decoder");
                        pending = unit;
                    }
                }
            }

            let frames = renderer.frames();
            summary.frames = frames.len();
            summary.presented = renderer.presented();
            summary.dummies = frames.iter().filter(|f| f.properties.dummy).count();
            summary.first_pts = frames.iter().map(|f| f.properties.pts).min();
            summary.last_pts = frames.iter().map(|f| f.properties.pts + f.properties.duration).max();
            Ok(summary)
        })
}

pub fn play(config: &ElectraConfig, options: PlayOptions) -> Result<()> {
    if options.segment_duration <= MediaTime::ZERO {
        return Err(AppError::InvalidInput("segment duration must be positive".to_string()));
    }
    let stream_types = options.stream_types();
    let sinks: Vec<Arc<TrackBufferManager>> = stream_types
        .iter()
        .map(|st| Arc::new(TrackBufferManager::new(*st, &config.buffer)))
        .collect();

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let mut demuxer =
        SegmentDemultiplexer::new(config, Arc::new(FileTransport::new()), Arc::clone(&sinks[0]))
            .with_events(events_tx);
    for sink in &sinks[1..] {
        demuxer = demuxer.with_sink(Arc::clone(sink));
    }
    let demuxer = demuxer.spawn()?;

    let players = sinks
        .iter()
        .map(|sink| spawn_player(sink.stream_type(), config.decode.clone(), Arc::clone(sink)))
        .collect::<std::io::Result<Vec<_>>>()?;

    for request in options.requests() {
        demuxer.request(request)?;
    }
    demuxer.end_of_stream()?;

    let mut failed = 0usize;
    for event in events_rx.iter() {
        match event {
            DemuxEvent::SegmentFinished(stats) => {
                if stats.outcome == SegmentOutcome::Failed {
                    failed += 1;
                }
                println!(
                    "{:<9} {:<40} {:>10} bytes  {:>12}  {:?}{}",
                    stats.stream_type.to_string(),
                    stats.url,
                    stats.bytes_downloaded,
                    stats.delivered_duration.to_string(),
                    stats.outcome,
                    if stats.inserted_filler { " +filler" } else { "" }
                );
                if let Some(reason) = &stats.failure_reason {
                    println!("          {reason}");
                }
            }
            DemuxEvent::EndOfStream { .. } => break,
        }
    }
    demuxer.join()?;

    for (stream_type, player) in stream_types.iter().zip(players) {
        let summary = player
            .join()
            .map_err(|_| AppError::InvalidInput(format!("{stream_type} player thread panicked")))??;
        let decoded: u64 = summary.metrics.iter().map(|m| m.decoded).sum();
        let discarded: u64 = summary.metrics.iter().map(|m| m.discarded).sum();
        println!(
            "{stream_type}: {} frames ({} presented, {} filler), {} decoded, {} discarded, {} decoder(s), {} .. {}",
            summary.frames,
            summary.presented,
            summary.dummies,
            decoded,
            discarded,
            summary.engines,
            summary.first_pts.unwrap_or_default(),
            summary.last_pts.unwrap_or_default(),
        );
    }

    if failed > 0 {
        warn!(failed, "Some segments failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(files: &[&str]) -> PlayOptions {
        PlayOptions {
            files: files.iter().map(PathBuf::from).collect(),
            init: Some(PathBuf::from("init.mp4")),
            stream_type: StreamType::Video,
            with_audio: true,
            segment_duration: MediaTime::from_millis(4_000),
            allow_missing: false,
        }
    }

    #[test]
    fn test_requests_follow_nominal_timeline() {
        let requests = options(&["a.m4s", "b.m4s", "c.m4s"]).requests();
        let starts: Vec<i64> = requests.iter().map(|r| r.start.as_millis()).collect();
        assert_eq!(starts, vec![0, 4_000, 8_000]);
        assert!(requests.iter().all(|r| r.init.as_ref().is_some_and(|i| i.url == "init.mp4")));
        assert_eq!(requests[1].url(), "b.m4s");
    }

    #[test]
    fn test_audio_sink_added_once() {
        assert_eq!(options(&[]).stream_types(), vec![StreamType::Video, StreamType::Audio]);
        let mut audio = options(&[]);
        audio.stream_type = StreamType::Audio;
        assert_eq!(audio.stream_types(), vec![StreamType::Audio]);
    }

    #[test]
    fn test_probe_unknown_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.bin");
        fs::write(&path, [0x47u8 ^ 0xFF; 64]).unwrap();
        assert!(matches!(probe(&path, None, false), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_play_webvtt_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("1.vtt");
        let second = dir.path().join("2.vtt");
        fs::write(&first, "WEBVTT\n\n00:00:00.500 --> 00:00:01.500\nhello\n").unwrap();
        fs::write(&second, "WEBVTT\n\n00:00:02.000 --> 00:00:03.000\nworld\n").unwrap();

        let mut config = ElectraConfig::default();
        config.demux.request_poll_ms = 10;
        let options = PlayOptions {
            files: vec![first, second, dir.path().join("missing.vtt")],
            init: None,
            stream_type: StreamType::Subtitle,
            with_audio: false,
            segment_duration: MediaTime::from_millis(2_000),
            allow_missing: true,
        };
        play(&config, options).unwrap();
    }
}
