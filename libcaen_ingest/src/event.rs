use super::discriminator::Classification;
use super::timestamp::AbsoluteTime;

/// A fully reconstructed event, ready to be stored
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbsoluteEvent {
    pub time: AbsoluteTime,
    /// PSD metric; None when it is undefined for this event
    pub discriminant: Option<f64>,
    pub energy: f64,
    pub classification: Classification,
}

impl AbsoluteEvent {
    /// The `channels` column of the event tables: `[discriminant, energy]`
    pub fn channels(&self) -> [Option<f64>; 2] {
        [self.discriminant, Some(self.energy)]
    }
}
