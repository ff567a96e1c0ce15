use std::num::NonZeroU16;
use std::time::Duration;

/// Container for MQTT Keep Alive intervals.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KeepAlive(Option<NonZeroU16>);

impl KeepAlive {
    /// Wrap a number of seconds as a Keep Alive interval.
    ///
    /// A value of zero means no Keep Alive interval.
    pub fn from_seconds(seconds: u16) -> KeepAlive {
        Self(NonZeroU16::new(seconds))
    }

    /// If this Keep Alive is nonzero, return it multiplied by 1.5 for use as
    /// a read timeout.
    ///
    /// > If the Keep Alive value is non-zero and the Server does not receive
    /// > an MQTT Control Packet from the Client within one and a half times
    /// > the Keep Alive time period, it MUST close the Network Connection to
    /// > the Client as if the network had failed [MQTT-3.1.2-24].
    pub fn as_timeout(self) -> Option<Duration> {
        self.0
            // `.mul_f32()` may panic if the result overflows or is not
            // finite, but a u16 number of seconds can never get there.
            .map(|seconds| Duration::from_secs(seconds.get().into()).mul_f32(1.5))
    }

    /// Return the number of seconds in this Keep Alive interval.
    pub fn as_seconds(self) -> u16 {
        self.0.map_or(0, |seconds| seconds.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disables_the_timeout() {
        assert!(KeepAlive::from_seconds(0).as_timeout().is_none());
        assert_eq!(KeepAlive::from_seconds(0).as_seconds(), 0);
    }

    #[test]
    fn timeout_is_one_and_a_half_intervals() {
        assert_eq!(
            KeepAlive::from_seconds(60).as_timeout(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            KeepAlive::from_seconds(1).as_timeout(),
            Some(Duration::from_millis(1500))
        );
    }
}
