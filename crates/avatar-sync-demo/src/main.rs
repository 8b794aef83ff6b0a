//! avatar-sync Demo
//!
//! Streams synthetic lip-sync chunks through the engine the way a network
//! transport would: metadata, out-of-order frame batches with inline PNG
//! images, then the chunk's speech audio. The engine is ticked at the host
//! rate on the main thread while a render thread consumes the handoff and
//! logs what it would draw and when audio would start.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use avatar_sync_core::{
    presentation_handoff, AvatarEngine, BatchFrame, DecodedImage, EngineConfig, EngineError,
    EngineHandle, FrameBatch, FrameSource, HandoffReader, ImageHandle, Point, RawChunkMetadata,
    RawOverlayFrame, Rect,
};
use bytes::Bytes;
use clap::Parser;
use image::{ImageFormat, Rgba, RgbaImage};

const BASE_SIZE: u32 = 64;
const MOUTH_SIZE: u32 = 16;
const TALK_FRAMES: usize = 24;
const IDLE_FRAMES: usize = 12;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Streams synthetic overlay chunks through the avatar sync engine")]
struct Args {
    /// Number of chunks in the simulated response
    #[arg(short, long, default_value_t = 4)]
    chunks: u32,

    /// Overlay frames per chunk
    #[arg(short, long, default_value_t = 36)]
    frames: u32,

    /// Frames per transport batch
    #[arg(long, default_value_t = 6)]
    batch_size: u32,

    /// Delay between batches, in milliseconds
    #[arg(long, default_value_t = 40)]
    batch_delay_ms: u64,

    /// Host presentation rate
    #[arg(long, default_value_t = 60)]
    tick_hz: u32,

    /// Use the low-latency buffering preset
    #[arg(long)]
    low_latency: bool,

    /// Cancel the response once this chunk index starts streaming
    #[arg(long)]
    cancel_at: Option<u32>,
}

fn encode_png(image: &RgbaImage) -> Result<Bytes, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(Bytes::from(out.into_inner()))
}

/// Base frames with a slowly shifting shade so indices are visible in dumps.
fn base_animation(frames: usize, tint: u8) -> Vec<ImageHandle> {
    (0..frames)
        .map(|i| {
            let shade = (i * 255 / frames.max(1)) as u8;
            let image = RgbaImage::from_pixel(BASE_SIZE, BASE_SIZE, Rgba([shade, tint, 128, 255]));
            Arc::new(DecodedImage::new(BASE_SIZE, BASE_SIZE, image.into_raw()))
        })
        .collect()
}

/// A mouth sprite whose opening depends on the matched base frame.
fn mouth_png(matched: u32) -> Result<Bytes, image::ImageError> {
    let open = matched % (MOUTH_SIZE / 2);
    let image = RgbaImage::from_fn(MOUTH_SIZE, MOUTH_SIZE, |_, y| {
        if y.abs_diff(MOUTH_SIZE / 2) <= open {
            Rgba([160, 20, 40, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    });
    encode_png(&image)
}

/// Simulated transport: feeds one response through the handle.
fn stream_response(
    handle: EngineHandle,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let batch_size = args.batch_size.max(1);
    let batches = args.frames.div_ceil(batch_size);
    let mut matched = 0u32;

    for chunk_index in 0..args.chunks {
        if args.cancel_at == Some(chunk_index) {
            tracing::info!("Transport: cancelling response at chunk {}", chunk_index);
            handle.force_reset();
            return Ok(());
        }

        handle.begin_chunk(&RawChunkMetadata {
            chunk_index: Some(i64::from(chunk_index)),
            animation_name: Some("talk".to_string()),
            zone_top_left: Some(Point::new(24.0, 40.0)),
            expected_batches: Some(i64::from(batches)),
        })?;

        // Swap the first two batches so the engine has to reorder them.
        let mut order: Vec<u32> = (0..batches).collect();
        if order.len() > 1 {
            order.swap(0, 1);
        }
        for batch_index in order {
            let start = batch_index * batch_size;
            let end = (start + batch_size).min(args.frames);
            let mut frames = Vec::with_capacity((end - start) as usize);
            for sequence in start..end {
                let base = matched + sequence;
                frames.push(BatchFrame {
                    frame: RawOverlayFrame {
                        matched_base_frame: Some(i64::from(base)),
                        sheet_id: Some(format!("mouth-{}", base % 8)),
                        sequence_index: Some(i64::from(sequence)),
                        coordinates: Some(Rect::new(0.0, 0.0, MOUTH_SIZE as f32, MOUTH_SIZE as f32)),
                        ..Default::default()
                    },
                    image: Some(mouth_png(base)?),
                });
            }
            handle.submit_batch(FrameBatch {
                chunk_index,
                batch_index,
                section_index: batch_index,
                frames,
            })?;
            thread::sleep(Duration::from_millis(args.batch_delay_ms));
        }
        handle.mark_chunk_ready(chunk_index)?;

        let pcm = Bytes::from(vec![0u8; 3200]);
        handle.queue_audio(chunk_index, pcm)?;
        matched += args.frames;
        tracing::debug!("Transport: chunk {} sent", chunk_index);
    }

    handle.signal_stream_end()?;
    Ok(())
}

/// Render side: what a platform layer would draw and play.
fn render_loop(reader: HandoffReader, done: Arc<AtomicBool>) {
    let mut drawn = 0u64;
    let mut last_chunk = None;
    while !done.load(Ordering::Acquire) {
        if let Some(presentation) = reader.read() {
            drawn += 1;
            if let FrameSource::Overlay {
                chunk_index,
                frame_index,
            } = presentation.source
            {
                if last_chunk != Some(chunk_index) {
                    tracing::info!(
                        "Render: chunk {} on screen ({}[{}], {} overlays)",
                        chunk_index,
                        presentation.animation_name,
                        presentation.base_index,
                        presentation.overlays.len()
                    );
                    last_chunk = Some(chunk_index);
                }
                tracing::trace!("Render: chunk {} frame {}", chunk_index, frame_index);
            } else {
                last_chunk = None;
            }
        }
        for start in reader.take_audio_starts() {
            tracing::info!(
                "Audio: chunk {} starts ({} bytes)",
                start.chunk_index,
                start.payload.len()
            );
        }
        for event in reader.take_diagnostics() {
            tracing::warn!("Diagnostic: {:?}", event);
        }
        if reader.take_all_complete() {
            tracing::info!("Render: response complete");
            done.store(true, Ordering::Release);
        }
        thread::sleep(Duration::from_millis(2));
    }
    tracing::info!("Render: {} distinct frames drawn", drawn);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("avatar_sync_core=info".parse()?)
                .add_directive("avatar_sync_demo=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = if args.low_latency {
        EngineConfig::low_latency()
    } else {
        EngineConfig::default()
    };

    let mut engine = AvatarEngine::new(config);
    engine.load_base_animation("idle", base_animation(IDLE_FRAMES, 40), Some(IDLE_FRAMES))?;
    engine.load_base_animation(
        "idle_reverse",
        base_animation(IDLE_FRAMES, 40).into_iter().rev().collect(),
        Some(IDLE_FRAMES),
    )?;
    engine.load_base_animation("talk", base_animation(TALK_FRAMES, 200), Some(TALK_FRAMES))?;

    let (mut sink, reader) = presentation_handoff();
    let done = Arc::new(AtomicBool::new(false));
    let render = {
        let done = Arc::clone(&done);
        thread::Builder::new()
            .name("demo-render".to_string())
            .spawn(move || render_loop(reader, done))?
    };

    let transport = {
        let handle = engine.handle();
        let args = args.clone();
        thread::Builder::new()
            .name("demo-transport".to_string())
            .spawn(move || {
                if let Err(e) = stream_response(handle, &args) {
                    tracing::error!("Transport failed: {}", e);
                }
            })?
    };

    let tick = Duration::from_secs_f64(1.0 / f64::from(args.tick_hz.max(1)));
    let started = Instant::now();
    let deadline = Duration::from_secs(60);
    let mut next = Instant::now();
    while !done.load(Ordering::Acquire) {
        engine.tick(&mut sink);
        if args.cancel_at.is_some()
            && transport.is_finished()
            && engine.is_idle()
            && engine.queued_chunks().is_empty()
        {
            tracing::info!("Response cancelled, engine idle");
            done.store(true, Ordering::Release);
        }
        if started.elapsed() > deadline {
            tracing::warn!("Demo deadline reached");
            done.store(true, Ordering::Release);
        }
        next += tick;
        thread::sleep(next.saturating_duration_since(Instant::now()));
    }

    let _ = transport.join();
    let _ = render.join();

    let m = engine.metrics().snapshot();
    tracing::info!(
        "Done in {:.2?}: {} ticks, {} steps, {} overlay / {} idle frames",
        started.elapsed(),
        m.ticks,
        m.logical_steps,
        m.overlay_frames_presented,
        m.idle_frames_presented
    );
    tracing::info!(
        "Chunks: {} started, {} completed, {} dropped; audio starts {}",
        m.chunks_started,
        m.chunks_completed,
        m.chunks_dropped,
        m.audio_started
    );
    tracing::info!(
        "Buffering: {} skip-draws ({:.1}%), {} hold-last ticks, {} timeouts, {} stall skips, {} failed frames shown",
        m.skip_draws,
        m.skip_draw_ratio() * 100.0,
        m.hold_last_ticks,
        m.buffer_timeouts,
        m.frame_stall_skips,
        m.failed_frames_shown
    );
    if m.decode_failures > 0 {
        return Err(EngineError::DecodeFailed(format!(
            "{} overlay images failed",
            m.decode_failures
        ))
        .into());
    }
    Ok(())
}
