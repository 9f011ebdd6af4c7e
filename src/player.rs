// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Playback scheduler: paces a decoded frame sequence against a monotonic
//! clock, with pause/seek/step primitives.
//!
//! The scheduler never sleeps or renders itself; the driving task calls
//! [Player::tick] with `Instant::now()` and renders the returned index.
//! All decisions read the caller-supplied monotonic clock, never wall
//! time.

use std::time::{Duration, Instant};

use crate::{Config, Metadata, DEFAULT_FPS};

/// Scheduler states. `Seeking` is only observable from within [Player::
/// seek]; it always returns to the state it entered from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlayerState {
    Playing,
    Paused,
    Seeking,
    Ended,
}

/// Paces frame indices `0..frame_count` at a target rate.
#[derive(Debug)]
pub struct Player {
    fps: f64,
    frame_count: u32,
    looping: bool,
    state: PlayerState,
    /// The instant corresponding to media position zero, while Playing.
    origin: Instant,
    /// Media position in seconds, while not Playing.
    held_pos: f64,
    last_rendered: Option<u32>,
}

impl Player {
    /// Starts Playing at frame 0. A rate that isn't a positive finite
    /// number falls back to [DEFAULT_FPS].
    pub fn new(frame_count: u32, fps: f64, now: Instant) -> Self {
        let fps = if fps.is_finite() && fps > 0. {
            fps
        } else {
            DEFAULT_FPS
        };
        Player {
            fps,
            frame_count,
            looping: false,
            state: if frame_count == 0 {
                PlayerState::Ended
            } else {
                PlayerState::Playing
            },
            origin: now,
            held_pos: 0.,
            last_rendered: None,
        }
    }

    /// Rate from the stream header: `frame_count / seconds`, else 24 fps.
    pub fn from_header(metadata: &Metadata, config: &Config, now: Instant) -> Self {
        Self::new(config.frame_count(), config.fps(metadata), now)
    }

    /// Wrap to frame 0 instead of ending.
    pub fn looping(mut self, v: bool) -> Self {
        self.looping = v;
        self
    }

    /// Begin Paused on frame 0 instead of Playing.
    pub fn start_paused(mut self) -> Self {
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
            self.held_pos = 0.;
        }
        self
    }

    #[inline]
    pub fn state(&self) -> PlayerState {
        self.state
    }

    #[inline]
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Current media position in seconds.
    pub fn position_secs(&self, now: Instant) -> f64 {
        match self.state {
            PlayerState::Playing => now
                .checked_duration_since(self.origin)
                .unwrap_or_default()
                .as_secs_f64(),
            _ => self.held_pos,
        }
    }

    /// Index of the last frame, as a clamp target.
    fn last_index(&self) -> u32 {
        self.frame_count.saturating_sub(1)
    }

    /// Largest seekable position: the start of the last frame.
    fn max_pos(&self) -> f64 {
        f64::from(self.last_index()) / self.fps
    }

    /// Advances the clock; returns the frame index to render if it changed
    /// since the last tick.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        if self.frame_count == 0 {
            return None;
        }
        let index = match self.state {
            PlayerState::Playing => {
                let pos = self.position_secs(now);
                let raw = (pos * self.fps).floor() as u64;
                if raw >= u64::from(self.frame_count) {
                    if self.looping {
                        (raw % u64::from(self.frame_count)) as u32
                    } else {
                        self.state = PlayerState::Ended;
                        self.held_pos = self.max_pos();
                        self.last_index()
                    }
                } else {
                    raw as u32
                }
            }
            _ => ((self.held_pos * self.fps).floor() as u32).min(self.last_index()),
        };
        if self.last_rendered == Some(index) {
            return None;
        }
        self.last_rendered = Some(index);
        Some(index)
    }

    pub fn pause(&mut self, now: Instant) {
        if self.state == PlayerState::Playing {
            self.held_pos = self.position_secs(now);
            self.state = PlayerState::Paused;
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if self.state == PlayerState::Paused {
            self.origin = now - Duration::from_secs_f64(self.held_pos);
            self.state = PlayerState::Playing;
        }
    }

    /// Space-bar behavior.
    pub fn toggle(&mut self, now: Instant) {
        match self.state {
            PlayerState::Playing => self.pause(now),
            PlayerState::Paused => self.resume(now),
            _ => {}
        }
    }

    /// Moves the position by `delta_secs`, clamped to the media bounds,
    /// passing through Seeking and returning to the prior state. Seeking
    /// away from Ended leaves the player Paused at the new position.
    pub fn seek(&mut self, now: Instant, delta_secs: f64) {
        let prior = self.state;
        if prior == PlayerState::Seeking || self.frame_count == 0 {
            return;
        }
        self.state = PlayerState::Seeking;
        let pos = match prior {
            PlayerState::Playing => now
                .checked_duration_since(self.origin)
                .unwrap_or_default()
                .as_secs_f64(),
            _ => self.held_pos,
        };
        let new_pos = (pos + delta_secs).max(0.).min(self.max_pos());
        match prior {
            PlayerState::Playing => {
                self.origin = now - Duration::from_secs_f64(new_pos);
                self.state = PlayerState::Playing;
            }
            _ => {
                self.held_pos = new_pos;
                self.state = PlayerState::Paused;
            }
        }
    }

    /// Moves one frame forward or back. Only valid while Paused; returns
    /// the new frame index, which is also considered rendered.
    pub fn step(&mut self, direction: i32) -> Option<u32> {
        if self.state != PlayerState::Paused || self.frame_count == 0 {
            return None;
        }
        let current = ((self.held_pos * self.fps).floor() as i64).min(self.last_index() as i64);
        let target = (current + i64::from(direction.signum()))
            .max(0)
            .min(self.last_index() as i64) as u32;
        // Park in the middle of the frame so float rounding can't slip to
        // a neighbor.
        self.held_pos = (f64::from(target) + 0.5) / self.fps;
        self.last_rendered = Some(target);
        Some(target)
    }

    /// Back to frame 0, Playing.
    pub fn restart(&mut self, now: Instant) {
        self.origin = now;
        self.held_pos = 0.;
        self.last_rendered = None;
        self.state = PlayerState::Playing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    #[test]
    fn paces_at_target_rate() {
        let t0 = Instant::now();
        let mut p = Player::new(10, 10., t0); // one frame per 100ms
        assert_eq!(p.state(), PlayerState::Playing);
        assert_eq!(p.tick(t0), Some(0));
        assert_eq!(p.tick(at(t0, 50)), None, "same frame isn't re-rendered");
        assert_eq!(p.tick(at(t0, 100)), Some(1));
        assert_eq!(p.tick(at(t0, 450)), Some(4));
    }

    #[test]
    fn ends_after_last_frame() {
        let t0 = Instant::now();
        let mut p = Player::new(3, 10., t0);
        assert_eq!(p.tick(at(t0, 250)), Some(2));
        assert_eq!(p.tick(at(t0, 300)), None, "holds the last frame");
        assert_eq!(p.state(), PlayerState::Ended);
    }

    #[test]
    fn loops_instead_of_ending() {
        let t0 = Instant::now();
        let mut p = Player::new(3, 10., t0).looping(true);
        assert_eq!(p.tick(at(t0, 250)), Some(2));
        assert_eq!(p.tick(at(t0, 300)), Some(0));
        assert_eq!(p.tick(at(t0, 410)), Some(1));
        assert_eq!(p.state(), PlayerState::Playing);
    }

    #[test]
    fn pause_holds_resume_continues() {
        let t0 = Instant::now();
        let mut p = Player::new(100, 10., t0);
        assert_eq!(p.tick(at(t0, 500)), Some(5));
        p.pause(at(t0, 500));
        assert_eq!(p.state(), PlayerState::Paused);
        assert_eq!(p.tick(at(t0, 5_000)), None, "position held while paused");
        p.resume(at(t0, 5_000));
        assert_eq!(p.tick(at(t0, 5_100)), Some(6));
    }

    #[test]
    fn toggle_is_space_bar() {
        let t0 = Instant::now();
        let mut p = Player::new(100, 10., t0);
        p.toggle(t0);
        assert_eq!(p.state(), PlayerState::Paused);
        p.toggle(t0);
        assert_eq!(p.state(), PlayerState::Playing);
    }

    #[test]
    fn seek_clamps_and_returns_to_prior_state() {
        let t0 = Instant::now();
        let mut p = Player::new(100, 10., t0);
        assert_eq!(p.tick(at(t0, 1_000)), Some(10));
        p.seek(at(t0, 1_000), 2.);
        assert_eq!(p.state(), PlayerState::Playing);
        assert_eq!(p.tick(at(t0, 1_000)), Some(30));
        p.seek(at(t0, 1_000), -100.);
        assert_eq!(p.tick(at(t0, 1_000)), Some(0), "clamped to start");
        p.seek(at(t0, 1_000), 1e6);
        assert_eq!(p.tick(at(t0, 1_000)), Some(99), "clamped to last frame");

        let mut p = Player::new(100, 10., t0).start_paused();
        p.seek(t0, 1.);
        assert_eq!(p.state(), PlayerState::Paused);
        assert_eq!(p.tick(t0), Some(10));
    }

    #[test]
    fn seek_from_ended_leaves_paused() {
        let t0 = Instant::now();
        let mut p = Player::new(3, 10., t0);
        p.tick(at(t0, 10_000));
        assert_eq!(p.state(), PlayerState::Ended);
        p.seek(at(t0, 10_000), -0.15);
        assert_eq!(p.state(), PlayerState::Paused);
        assert_eq!(p.tick(at(t0, 10_000)), Some(0));
    }

    #[test]
    fn step_only_while_paused() {
        let t0 = Instant::now();
        let mut p = Player::new(5, 10., t0);
        assert_eq!(p.step(1), None, "stepping while playing is invalid");
        p.pause(t0);
        assert_eq!(p.step(1), Some(1));
        assert_eq!(p.step(1), Some(2));
        assert_eq!(p.step(-1), Some(1));
        assert_eq!(p.step(-1), Some(0));
        assert_eq!(p.step(-1), Some(0), "clamped at first frame");
        for _ in 0..10 {
            p.step(1);
        }
        assert_eq!(p.step(1), Some(4), "clamped at last frame");
    }

    #[test]
    fn restart_rewinds_and_plays() {
        let t0 = Instant::now();
        let mut p = Player::new(3, 10., t0);
        p.tick(at(t0, 10_000));
        assert_eq!(p.state(), PlayerState::Ended);
        p.restart(at(t0, 10_000));
        assert_eq!(p.state(), PlayerState::Playing);
        assert_eq!(p.tick(at(t0, 10_000)), Some(0));
        assert_eq!(p.tick(at(t0, 10_100)), Some(1));
    }

    #[test]
    fn empty_media_is_ended() {
        let t0 = Instant::now();
        let mut p = Player::new(0, 10., t0);
        assert_eq!(p.state(), PlayerState::Ended);
        assert_eq!(p.tick(t0), None);
    }

    #[test]
    fn bad_fps_falls_back() {
        let t0 = Instant::now();
        assert!((Player::new(10, 0., t0).fps() - DEFAULT_FPS).abs() < 1e-9);
        assert!((Player::new(10, f64::NAN, t0).fps() - DEFAULT_FPS).abs() < 1e-9);
    }
}
