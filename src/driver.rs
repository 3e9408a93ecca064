use std::time::Duration;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace, warn};

use crate::command::{Command, RcAxes};
use crate::config::LinkConfig;
use crate::link::connection::ConnectionActor;

pub type DeviceId = u32;

/// Notifications from the input backend about gamepads coming and going
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    Connected(DeviceId),
    Disconnected(DeviceId),
}

/// A snapshot of a gamepad: the three buttons we map to commands, and four axes, each
///  normalized to `-1.0..=1.0`. Axis numbering follows the usual gamepad layout: 0/1 are the left
///  stick's x/y, 2/3 the right stick's x/y. The y axes grow downward.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GamepadState {
    pub button_a: bool,
    pub button_b: bool,
    pub button_x: bool,
    pub axes: [f32; 4],
}

impl GamepadState {
    /// For backends that report stick y values with 'up' as positive
    pub fn from_y_up_sticks(button_a: bool, button_b: bool, button_x: bool, left: [f32; 2], right: [f32; 2]) -> GamepadState {
        GamepadState {
            button_a,
            button_b,
            button_x,
            axes: [left[0], -left[1], right[0], -right[1]],
        }
    }
}

/// The input backend, polled once per tick
#[cfg_attr(test, automock)]
pub trait InputDevice: Send {
    /// `None` if the device can not be read right now
    fn gamepad_state(&mut self, id: DeviceId) -> Option<GamepadState>;
}

#[cfg_attr(test, automock)]
pub trait CommandSink: Send + Sync {
    fn send_command(&self, command: &Command);
}

impl CommandSink for ConnectionActor {
    fn send_command(&self, command: &Command) {
        ConnectionActor::send_command(self, command)
    }
}

/// Polls an [InputDevice] at a fixed interval and turns its state into commands.
///
/// Which device is polled is tracked from [DeviceEvent]s arriving on a channel, so there is no
///  shared 'currently connected' state between the input backend and the driver.
pub struct Driver<D: InputDevice> {
    device: D,
    device_events: mpsc::Receiver<DeviceEvent>,
    connected: Option<DeviceId>,
    poll_interval: Duration,
    reported_no_device: bool,
}

impl<D: InputDevice> Driver<D> {
    pub fn new(device: D, device_events: mpsc::Receiver<DeviceEvent>, initially_connected: Option<DeviceId>, config: &LinkConfig) -> Driver<D> {
        Driver {
            device,
            device_events,
            connected: initially_connected,
            poll_interval: config.poll_interval,
            reported_no_device: false,
        }
    }

    pub fn connected_device(&self) -> Option<DeviceId> {
        self.connected
    }

    /// The commands for one tick: `command`, `takeoff` and `land` for each pressed button (in
    ///  that order), followed by exactly one `rc` command from the axes.
    pub fn commands_for(state: &GamepadState) -> Vec<Command> {
        let mut result = Vec::with_capacity(4);
        if state.button_a {
            result.push(Command::Command);
        }
        if state.button_b {
            result.push(Command::Takeoff);
        }
        if state.button_x {
            result.push(Command::Land);
        }

        let [left_x, left_y, right_x, right_y] = state.axes;
        result.push(Command::Rc(RcAxes::from_normalized(right_x, right_y, left_y, left_x)));
        result
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Connected(id) => {
                info!("gamepad {} connected", id);
                self.connected = Some(id);
                self.reported_no_device = false;
            }
            DeviceEvent::Disconnected(id) => {
                if self.connected == Some(id) {
                    info!("gamepad {} disconnected", id);
                    self.connected = None;
                }
                else {
                    debug!("ignoring disconnect of gamepad {} which is not the one in use", id);
                }
            }
        }
    }

    /// One polling step: applies pending device events, reads the device and sends the
    ///  resulting commands. Returns the number of commands sent.
    pub fn poll(&mut self, sink: &dyn CommandSink) -> usize {
        loop {
            match self.device_events.try_recv() {
                Ok(event) => self.on_device_event(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let Some(id) = self.connected else {
            if !self.reported_no_device {
                warn!("no gamepad connected");
                self.reported_no_device = true;
            }
            return 0;
        };

        let Some(state) = self.device.gamepad_state(id) else {
            debug!("gamepad {} could not be read", id);
            return 0;
        };

        let commands = Self::commands_for(&state);
        for command in &commands {
            trace!("command: {}", command);
            sink.send_command(command);
        }
        commands.len()
    }

    /// Polls forever at the configured interval
    pub async fn run(mut self, sink: &dyn CommandSink) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.poll(sink);
        }
    }
}
