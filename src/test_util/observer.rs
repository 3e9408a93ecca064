use std::sync::Mutex;

use crate::link::link_error::Direction;
use crate::link::observer::LinkObserver;

#[derive(Default)]
pub struct RecordingObserver {
    messages: Mutex<Vec<String>>,
    errors: Mutex<Vec<(Direction, String)>>,
}

impl RecordingObserver {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(Direction, String)> {
        self.errors.lock().unwrap().clone()
    }
}

impl LinkObserver for RecordingObserver {
    fn on_message(&self, text: &str) {
        self.messages.lock().unwrap()
            .push(text.to_string());
    }

    fn on_error(&self, direction: Direction, message: &str) {
        self.errors.lock().unwrap()
            .push((direction, message.to_string()));
    }
}
