use crate::backend::ProgressFn;

/// Whole percentage of `sent` over `total`, floored so that 100 is only
/// reached once every byte is out. An empty payload is complete.
pub fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let sent = sent.min(total) as u128;
    ((sent * 100) / total as u128) as u8
}

/// Turns byte counts into percentages and forwards each new value once, so
/// the sink sees a strictly increasing sequence.
pub struct UploadProgress {
    total: u64,
    sent: u64,
    last: Option<u8>,
    sink: ProgressFn,
}

impl UploadProgress {
    pub fn new(total: u64, sink: ProgressFn) -> Self {
        Self {
            total,
            sent: 0,
            last: None,
            sink,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.sent = self.sent.saturating_add(bytes).min(self.total);
        self.emit(percent_of(self.sent, self.total));
    }

    /// Reports an explicit percentage, ignoring anything not above the last one.
    pub fn report(&mut self, percent: u8) {
        self.emit(percent.min(100));
    }

    pub fn finish(&mut self) {
        self.sent = self.total;
        self.emit(100);
    }

    fn emit(&mut self, percent: u8) {
        if self.last.is_some_and(|last| percent <= last) {
            return;
        }
        self.last = Some(percent);
        (self.sink)(percent);
    }
}
