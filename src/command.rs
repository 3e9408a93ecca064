use std::fmt::{Display, Formatter};

/// Range limit for every field of an `rc` command, in both directions
pub const AXIS_LIMIT: i32 = 100;

/// The text commands understood by the remote device, one per datagram
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    /// switches the device into command mode - nothing else is accepted before this
    Command,
    Takeoff,
    Land,
    /// continuous remote control: four channels, each in `-100..=100`
    Rc(RcAxes),
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Command => write!(f, "command"),
            Command::Takeoff => write!(f, "takeoff"),
            Command::Land => write!(f, "land"),
            Command::Rc(axes) => write!(f, "rc {} {} {} {}", axes.a, axes.b, axes.c, axes.d),
        }
    }
}

/// The four channels of an `rc` command. Values are always in `-AXIS_LIMIT..=AXIS_LIMIT`, which
///  is ensured by the constructors.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RcAxes {
    a: i32,
    b: i32,
    c: i32,
    d: i32,
}

impl RcAxes {
    /// takes values that are already scaled to the command's range, clamping them if necessary
    pub fn new(a: i32, b: i32, c: i32, d: i32) -> RcAxes {
        RcAxes {
            a: clamp_axis(a),
            b: clamp_axis(b),
            c: clamp_axis(c),
            d: clamp_axis(d),
        }
    }

    /// takes normalized device axis values (nominally `-1.0..=1.0`)
    pub fn from_normalized(a: f32, b: f32, c: f32, d: f32) -> RcAxes {
        RcAxes::new(
            scale_axis(a),
            scale_axis(b),
            scale_axis(c),
            scale_axis(d),
        )
    }

    pub fn values(&self) -> [i32; 4] {
        [self.a, self.b, self.c, self.d]
    }
}

pub fn clamp_axis(value: i32) -> i32 {
    value.clamp(-AXIS_LIMIT, AXIS_LIMIT)
}

/// Scales a normalized axis by 100, truncating towards zero. Out-of-range input (including
///  values the device reports beyond +/-1.0) is clamped rather than rejected.
pub fn scale_axis(normalized: f32) -> i32 {
    // `as` saturates for huge values and maps NaN to 0
    clamp_axis((normalized * AXIS_LIMIT as f32) as i32)
}
