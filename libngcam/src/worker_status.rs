use super::packet::SpectrumRecord;
use super::pulse::Pulse;

/// What a capture thread is telling the front end
#[derive(Debug, Clone, Default)]
pub enum StatusKind {
    /// A pack was drained
    #[default]
    Progress,
    /// The addressed camera's first waveform record of the last pack
    Waveform(Pulse),
    /// The addressed channel's spectrum records of the last pack
    Spectrum(Vec<SpectrumRecord>),
    /// The card reached its target pack count (or was cancelled) and its worker joined
    Finished,
    /// Every card in the run has finished
    AllFinished,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct CardStatus {
    pub progress: f32,
    pub packs_done: u64,
    pub packs_target: u64,
    pub card: usize,
    pub kind: StatusKind,
}

impl CardStatus {
    pub fn new(card: usize, packs_done: u64, packs_target: u64, kind: StatusKind) -> Self {
        let progress = if packs_target == 0 {
            1.0
        } else {
            packs_done as f32 / packs_target as f32
        };
        Self {
            progress,
            packs_done,
            packs_target,
            card,
            kind,
        }
    }
}
