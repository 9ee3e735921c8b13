//! Brightness waveforms for the display animation loop.

use std::time::Duration;

use crate::types::AnimationPattern;

pub const STEP: i16 = 8;
pub const MAX_BRIGHTNESS: i16 = 100;
/// Brightness written when an animation loop ends.
pub const RESTING_BRIGHTNESS: u8 = 70;

const BLINK_INTERVAL: Duration = Duration::from_millis(500);
const RAMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct Waveform {
    pattern: AnimationPattern,
    // Kept unclamped so the ramps can wrap past the ends.
    level: i16,
    direction: Direction,
}

impl Waveform {
    pub fn new(pattern: AnimationPattern) -> Self {
        Self {
            pattern,
            level: 0,
            direction: Direction::Up,
        }
    }

    pub fn pattern(&self) -> AnimationPattern {
        self.pattern
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn brightness(&self) -> u8 {
        self.level.clamp(0, MAX_BRIGHTNESS) as u8
    }

    /// Pause between two writes.
    pub fn interval(&self) -> Duration {
        match self.pattern {
            AnimationPattern::Blinking => BLINK_INTERVAL,
            _ => RAMP_INTERVAL,
        }
    }

    /// Advances one step and returns the brightness to write.
    pub fn next_brightness(&mut self) -> u8 {
        match self.pattern {
            AnimationPattern::Blinking => {
                self.level = if self.level > 0 { 0 } else { MAX_BRIGHTNESS };
            }
            AnimationPattern::Breathing => match self.direction {
                Direction::Up => {
                    self.level += STEP;
                    if self.level >= MAX_BRIGHTNESS {
                        self.level = MAX_BRIGHTNESS;
                        self.direction = Direction::Down;
                    }
                }
                Direction::Down => {
                    self.level -= STEP;
                    if self.level <= 0 {
                        self.level = 0;
                        self.direction = Direction::Up;
                    }
                }
            },
            AnimationPattern::Ascending => {
                self.level += STEP;
                if self.level > MAX_BRIGHTNESS {
                    self.level = -STEP;
                }
            }
            AnimationPattern::Descending => {
                self.direction = Direction::Down;
                self.level -= STEP;
                if self.level < 0 {
                    self.level = MAX_BRIGHTNESS + STEP;
                }
            }
        }
        self.brightness()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn take(pattern: AnimationPattern, n: usize) -> Vec<u8> {
        let mut wave = Waveform::new(pattern);
        (0..n).map(|_| wave.next_brightness()).collect()
    }

    #[test]
    fn blinking_toggles_full_and_off() {
        assert_eq!(take(AnimationPattern::Blinking, 4), vec![100, 0, 100, 0]);
        assert_eq!(
            Waveform::new(AnimationPattern::Blinking).interval(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn breathing_reverses_at_bounds() {
        let values = take(AnimationPattern::Breathing, 30);
        assert_eq!(values[..13].last(), Some(&100));
        assert_eq!(values[13], 92);
        assert_eq!(values[25], 0);
        assert_eq!(values[26], 8);
        assert!(values.iter().all(|value| *value <= 100));
    }

    #[test]
    fn ascending_wraps_to_zero_after_the_top() {
        let values = take(AnimationPattern::Ascending, 15);
        assert_eq!(&values[10..15], &[88, 96, 0, 0, 8]);
    }

    #[test]
    fn descending_wraps_to_full_below_zero() {
        let values = take(AnimationPattern::Descending, 4);
        assert_eq!(values, vec![100, 100, 92, 84]);
        let values = take(AnimationPattern::Descending, 16);
        assert_eq!(&values[13..16], &[4, 100, 100]);
    }
}
