use super::record::{Event, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Execute every record.
    Program,
    /// Only run the verification sections of the image, never touching NVM.
    Verify,
}

/// NVM image words staged by an `NVM_DATA` record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NvmBuffer {
    words: Vec<u16>,
    armed: bool,
}

impl NvmBuffer {
    /// Replaces the staged words and arms verification.
    pub fn load(&mut self, words: Vec<u16>) {
        self.words = words;
        self.armed = true;
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Disarms, returning whether a verification was pending.
    pub fn take_armed(&mut self) -> bool {
        std::mem::replace(&mut self.armed, false)
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }
}

/// Per-run state of the record processor.
#[derive(Debug, Clone)]
pub struct Session {
    mode: Mode,
    suppressed: bool,
    nvm: NvmBuffer,
}

impl Session {
    pub fn new(mode: Mode) -> Self {
        Session {
            mode,
            suppressed: false,
            nvm: NvmBuffer::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn nvm(&self) -> &NvmBuffer {
        &self.nvm
    }

    pub fn nvm_mut(&mut self) -> &mut NvmBuffer {
        &mut self.nvm
    }

    /// Tracks which part of the image is running. Only a verify run gates on
    /// events: everything outside the before-verify section is skipped.
    pub fn on_event(&mut self, event: Event) {
        if self.mode != Mode::Verify {
            return;
        }
        match event {
            Event::InSystemChipBeforeVerify => self.suppressed = false,
            Event::AfterDone => {}
            _ => self.suppressed = true,
        }
    }

    /// Whether `record` is to be executed right now.
    pub fn admits(&self, record: &Record) -> bool {
        !self.suppressed
            || matches!(
                record,
                Record::NvmData { .. } | Record::Event(_) | Record::EndOfRecords
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_mode_ignores_events() {
        let mut session = Session::new(Mode::Program);
        session.on_event(Event::BeforeBegin);
        assert!(!session.is_suppressed());
        assert!(session.admits(&Record::DelayMs(1)));
    }

    #[test]
    fn verify_mode_window() {
        let mut session = Session::new(Mode::Verify);
        assert!(session.admits(&Record::DelayMs(1)));

        session.on_event(Event::BeforeBegin);
        assert!(!session.admits(&Record::DelayMs(1)));
        assert!(session.admits(&Record::EndOfRecords));
        assert!(session.admits(&Record::NvmData {
            target: crate::update::record::Target {
                address: 0x40,
                command: 0xbf,
                pec: Some(false)
            },
            words: vec![]
        }));

        session.on_event(Event::InSystemChipBeforeVerify);
        assert!(session.admits(&Record::DelayMs(1)));
        // After-done leaves the window as it was.
        session.on_event(Event::AfterDone);
        assert!(!session.is_suppressed());
        session.on_event(Event::InSystemChipAfterVerify);
        assert!(session.is_suppressed());
    }

    #[test]
    fn nvm_buffer_arming() {
        let mut nvm = NvmBuffer::default();
        assert!(!nvm.take_armed());
        nvm.load(vec![1, 2]);
        assert!(nvm.is_armed());
        assert!(nvm.take_armed());
        assert!(!nvm.is_armed());
        assert_eq!(nvm.words(), [1, 2]);
    }
}
