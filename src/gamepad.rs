//! Gamepad input for the [Driver](crate::driver::Driver).
//!
//! [SharedGamepads] is the [InputDevice] the driver polls. It is a snapshot of every connected
//!  gamepad's state, written by an input backend and read by the driver. Backends report
//!  connects and disconnects as [DeviceEvent]s on the driver's channel.
//!
//! With the `gamepad` feature, [spawn_gilrs_backend] provides such a backend on top of `gilrs`.
//!  `gilrs` handles are bound to the thread that created them, so the backend runs on a
//!  dedicated OS thread rather than inside the tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::driver::{DeviceId, GamepadState, InputDevice};
#[cfg(feature = "gamepad")] use crate::driver::DeviceEvent;

#[derive(Clone, Default)]
pub struct SharedGamepads {
    states: Arc<Mutex<HashMap<DeviceId, GamepadState>>>,
}

impl SharedGamepads {
    pub fn new() -> SharedGamepads {
        Default::default()
    }

    pub fn update(&self, id: DeviceId, state: GamepadState) {
        self.lock().insert(id, state);
    }

    pub fn remove(&self, id: DeviceId) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, GamepadState>> {
        self.states.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InputDevice for SharedGamepads {
    fn gamepad_state(&mut self, id: DeviceId) -> Option<GamepadState> {
        self.lock().get(&id).copied()
    }
}

/// Starts a thread that reads gamepads through `gilrs`, keeps the returned [SharedGamepads]
///  current and sends connect / disconnect events to `device_events`. Gamepads that are
///  connected at startup are reported as connect events as well.
///
/// The thread stops when the receiving end of `device_events` is dropped.
#[cfg(feature = "gamepad")]
pub fn spawn_gilrs_backend(device_events: tokio::sync::mpsc::Sender<DeviceEvent>, poll_interval: std::time::Duration) -> anyhow::Result<SharedGamepads> {
    use tracing::{debug, error, info};

    let gamepads = SharedGamepads::new();
    let (init_sender, init_receiver) = std::sync::mpsc::sync_channel::<Result<(), String>>(1);

    let shared = gamepads.clone();
    std::thread::Builder::new()
        .name("gamepad".to_string())
        .spawn(move || {
            let mut gilrs = match gilrs::Gilrs::new() {
                Ok(gilrs) => gilrs,
                Err(e) => {
                    let _ = init_sender.send(Err(e.to_string()));
                    return;
                }
            };
            let _ = init_sender.send(Ok(()));

            let initial = gilrs.gamepads()
                .map(|(id, gamepad)| {
                    info!("found gamepad {:?}: {}", id, gamepad.name());
                    device_id(id)
                })
                .collect::<Vec<_>>();
            for id in initial {
                if device_events.blocking_send(DeviceEvent::Connected(id)).is_err() {
                    return;
                }
            }

            loop {
                while let Some(event) = gilrs.next_event() {
                    let id = device_id(event.id);
                    let device_event = match event.event {
                        gilrs::EventType::Connected => DeviceEvent::Connected(id),
                        gilrs::EventType::Disconnected => {
                            shared.remove(id);
                            DeviceEvent::Disconnected(id)
                        }
                        _ => continue,
                    };
                    if device_events.blocking_send(device_event).is_err() {
                        debug!("gamepad events are no longer consumed, stopping");
                        return;
                    }
                }

                for (id, gamepad) in gilrs.gamepads() {
                    shared.update(device_id(id), read_state(&gamepad));
                }

                if device_events.is_closed() {
                    return;
                }
                std::thread::sleep(poll_interval);
            }
        })?;

    match init_receiver.recv() {
        Ok(Ok(())) => Ok(gamepads),
        Ok(Err(msg)) => {
            error!("unable to initialize gamepad input: {}", msg);
            anyhow::bail!("unable to initialize gamepad input: {}", msg)
        }
        Err(_) => anyhow::bail!("gamepad thread terminated during initialization"),
    }
}

#[cfg(feature = "gamepad")]
fn device_id(id: gilrs::GamepadId) -> DeviceId {
    usize::from(id) as DeviceId
}

#[cfg(feature = "gamepad")]
fn read_state(gamepad: &gilrs::Gamepad) -> GamepadState {
    use gilrs::{Axis, Button};

    // A / B / X are the south / east / west face buttons
    GamepadState::from_y_up_sticks(
        gamepad.is_pressed(Button::South),
        gamepad.is_pressed(Button::East),
        gamepad.is_pressed(Button::West),
        [gamepad.value(Axis::LeftStickX), gamepad.value(Axis::LeftStickY)],
        [gamepad.value(Axis::RightStickX), gamepad.value(Axis::RightStickY)],
    )
}
