//! Logical cadence through `AvatarEngine::tick` when the host presents
//! faster than the animations run.
//!
//! The host ticks at 60 Hz while idle and overlay both advance at 30 Hz, so
//! a logical step should land on every other tick, including across mode
//! transitions.

mod common;

mod cadence_tests {
    use avatar_sync_core::{EngineConfig, FrameSource};

    use crate::common::{raw_frames, Harness};

    fn harness() -> Harness {
        Harness::new(EngineConfig {
            min_frames_before_start: 2,
            idle_fps: 30,
            overlay_fps: 30,
            ..Default::default()
        })
        .presenting_at(60)
    }

    fn alternating(n: usize) -> Vec<bool> {
        (0..n).map(|i| i % 2 == 0).collect()
    }

    fn frame_index(source: FrameSource) -> Option<usize> {
        match source {
            FrameSource::Overlay { frame_index, .. } => Some(frame_index),
            FrameSource::Idle => None,
        }
    }

    /// A chunk that becomes ready mid-idle starts on the next step boundary,
    /// not on the tick it became ready.
    #[test]
    fn test_idle_to_overlay_keeps_cadence() {
        let mut h = harness();
        let mut stepped: Vec<bool> = (0..6).map(|_| h.tick_stepped()).collect();

        let frames = raw_frames("a", &[0, 1, 2, 3]);
        h.enqueue(0, &frames);
        h.ready(0, &frames);
        stepped.extend((0..14).map(|_| h.tick_stepped()));

        assert_eq!(stepped, alternating(20));
        assert_eq!(h.sink.presentations[5].source, FrameSource::Idle);
        assert_eq!(
            h.sink.presentations[6].source,
            FrameSource::Overlay {
                chunk_index: 0,
                frame_index: 0
            }
        );
        let sources: Vec<FrameSource> = h.sink.shown_steps().into_iter().map(|(_, s)| s).collect();
        assert_eq!(sources.len(), 10);
        assert!(sources[..3].iter().all(|s| *s == FrameSource::Idle));
        assert_eq!(
            sources[3..7].iter().map(|s| frame_index(*s)).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2), Some(3)]
        );
        assert!(sources[7..].iter().all(|s| *s == FrameSource::Idle));
    }

    /// The step that finishes a chunk already shows idle; idle does not step
    /// again on the very next tick.
    #[test]
    fn test_overlay_to_idle_keeps_cadence() {
        let mut h = harness();
        let frames = raw_frames("a", &[0, 1, 2]);
        h.enqueue(0, &frames);
        h.ready(0, &frames);

        let stepped: Vec<bool> = (0..14).map(|_| h.tick_stepped()).collect();
        assert_eq!(stepped, alternating(14));

        let p = &h.sink.presentations;
        assert_eq!(frame_index(p[4].source), Some(2));
        assert_eq!(p[6].source, FrameSource::Idle);
        assert_eq!(p[6].base_index, 0);
        // Held on the next tick, advanced on the one after.
        assert_eq!(p[7].step, p[6].step);
        assert_eq!(p[7].base_index, 0);
        assert_eq!(p[8].base_index, 1);
        assert_eq!(h.engine.metrics().snapshot().chunks_completed, 1);
    }

    /// A host stall much longer than two frames is followed by at most two
    /// catch-up steps, each advancing the chunk by exactly one frame.
    #[test]
    fn test_stall_catch_up_is_bounded() {
        let mut h = harness();
        let frames = raw_frames("a", &(0..40).collect::<Vec<u32>>());
        h.enqueue(0, &frames);
        h.ready(0, &frames);

        let before: Vec<bool> = (0..6).map(|_| h.tick_stepped()).collect();
        assert_eq!(before, alternating(6));
        let index = |h: &Harness| h.engine.active_playback().unwrap().1.current_index;
        assert_eq!(index(&h), 2);

        let frame = h.engine.config().overlay_frame_duration();
        let steps = h.engine.metrics().snapshot().logical_steps;
        h.tick_after(frame * 10);
        assert_eq!(h.engine.metrics().snapshot().logical_steps, steps + 1);
        assert_eq!(index(&h), 3);

        let mut catch_up = 0;
        while h.tick_stepped() {
            catch_up += 1;
            assert!(catch_up <= 2, "stall produced a burst of steps");
        }
        assert_eq!(catch_up, 2);
        assert_eq!(index(&h), 5);

        // Back to one step every other tick.
        let after: Vec<bool> = (0..6).map(|_| h.tick_stepped()).collect();
        assert_eq!(after, vec![true, false, true, false, true, false]);
        assert_eq!(index(&h), 8);

        let shown: Vec<usize> = h
            .sink
            .presentations
            .iter()
            .filter_map(|p| frame_index(p.source))
            .collect();
        assert!(shown.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1));
    }
}
