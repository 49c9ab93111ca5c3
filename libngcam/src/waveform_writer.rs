use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File};
use ndarray::s;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::constants::{NUMBER_OF_CHANNELS, PULSE_LENGTH};
use super::error::HDF5WriterError;
use super::packet::{decode_waveform, Deinterleaver};
use super::persist::raw_file_path;
use super::pulse::{pulses_to_matrix, split_records, Pulse};

/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

/// Records per HDF5 chunk of a channel dataset
const CHUNK_RECORDS: usize = 64;

/// A simple struct which wraps around the hdf5-rust library.
///
/// Writes de-interleaved waveforms as fixed-length records, one dataset per channel, grouped
/// by board.
#[derive(Debug)]
pub struct WaveformWriter {
    file_handle: File,
    path: PathBuf,
    boards_written: u32,
}
// Structure
// version
// board_#
// |---- channel_0(dset) [count x 512] - board, channel, record_length
// |---- channel_1(dset)
// |---- channel_2(dset)
// |---- channel_3(dset)

impl WaveformWriter {
    /// Create the writer, opening a file at path
    pub fn new(path: &Path) -> Result<Self, HDF5WriterError> {
        let file_handle = File::create(path)?;
        let version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);
        // only interior nul bytes are rejected
        if let Ok(value) = VarLenUnicode::from_str(&version) {
            file_handle
                .new_attr::<VarLenUnicode>()
                .create("version")?
                .write_scalar(&value)?;
        }
        Ok(Self {
            file_handle,
            path: path.to_path_buf(),
            boards_written: 0,
        })
    }

    /// Create the board group with four empty, growable channel datasets
    pub fn board(&mut self, board: usize) -> Result<BoardDatasets, HDF5WriterError> {
        let group_name = format!("board_{board}");
        let group = match self.file_handle.group(&group_name) {
            Ok(group) => group,
            Err(_) => self.file_handle.create_group(&group_name)?,
        };
        let mut datasets = Vec::with_capacity(NUMBER_OF_CHANNELS);
        for channel in 0..NUMBER_OF_CHANNELS {
            let dset = group
                .new_dataset::<i16>()
                .chunk((CHUNK_RECORDS, PULSE_LENGTH))
                .shape((0.., PULSE_LENGTH))
                .create(format!("channel_{channel}").as_str())?;
            dset.new_attr::<u32>()
                .create("board")?
                .write_scalar(&(board as u32))?;
            dset.new_attr::<u32>()
                .create("channel")?
                .write_scalar(&(channel as u32))?;
            dset.new_attr::<u32>()
                .create("record_length")?
                .write_scalar(&(PULSE_LENGTH as u32))?;
            datasets.push(dset);
        }
        self.boards_written += 1;
        Ok(BoardDatasets {
            board,
            datasets,
            rows: [0; NUMBER_OF_CHANNELS],
        })
    }

    /// Write the four channel collections of one board
    pub fn write_board(
        &mut self,
        board: usize,
        channels: &[Vec<Pulse>; NUMBER_OF_CHANNELS],
    ) -> Result<(), HDF5WriterError> {
        let mut datasets = self.board(board)?;
        for (channel, pulses) in channels.iter().enumerate() {
            datasets.append(channel, pulses)?;
        }
        Ok(())
    }

    /// Flush and close the file
    pub fn close(self) -> Result<(), HDF5WriterError> {
        self.file_handle.flush()?;
        spdlog::info!(
            "Wrote waveforms of {} boards to {}",
            self.boards_written,
            self.path.display()
        );
        Ok(())
    }
}

/// The open channel datasets of one board, grown as records arrive
#[derive(Debug)]
pub struct BoardDatasets {
    board: usize,
    datasets: Vec<Dataset>,
    rows: [usize; NUMBER_OF_CHANNELS],
}

impl BoardDatasets {
    /// Append records to the end of a channel dataset
    pub fn append(&mut self, channel: usize, pulses: &[Pulse]) -> Result<(), HDF5WriterError> {
        let dset = self
            .datasets
            .get(channel)
            .ok_or(HDF5WriterError::BadChannel(channel))?;
        if pulses.is_empty() {
            return Ok(());
        }
        let start = self.rows[channel];
        let end = start + pulses.len();
        dset.resize((end, PULSE_LENGTH))?;
        dset.write_slice(&pulses_to_matrix(pulses), s![start..end, ..])?;
        self.rows[channel] = end;
        Ok(())
    }

    pub fn board(&self) -> usize {
        self.board
    }

    /// Records written so far per channel
    pub fn rows(&self) -> [usize; NUMBER_OF_CHANNELS] {
        self.rows
    }
}

/// Counts from exporting one card's packs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub packs_read: u64,
    pub packs_skipped: u64,
    pub records: [usize; NUMBER_OF_CHANNELS],
}

/// Split every raw pack a card wrote for a shot into 512-sample records and append them to
/// one board of the writer.
///
/// Packs are read in order from 1 until the first missing file and written out one at a
/// time. Packs with a bad header are skipped with a warning.
pub fn export_card(
    writer: &mut WaveformWriter,
    shot_directory: &Path,
    card: usize,
    deinterleaver: &dyn Deinterleaver,
    big_endian: bool,
) -> Result<ExportSummary, HDF5WriterError> {
    let mut summary = ExportSummary::default();
    let mut board = writer.board(card)?;
    let mut pack_index = 1;
    loop {
        let path = raw_file_path(shot_directory, card, pack_index);
        if !path.exists() {
            break;
        }
        let buffer = std::fs::read(&path)?;
        match decode_waveform(&buffer) {
            Ok(packet) => {
                let streams = deinterleaver.deinterleave(packet.payload, big_endian);
                for (channel, stream) in streams.iter().enumerate() {
                    board.append(channel, &split_records(stream))?;
                }
                summary.packs_read += 1;
            }
            Err(e) => {
                spdlog::warn!("Skipping {}: {e}", path.display());
                summary.packs_skipped += 1;
            }
        }
        pack_index += 1;
    }
    summary.records = board.rows();
    spdlog::info!(
        "Card {}: exported {} packs ({} skipped), records per channel {:?}",
        board.board(),
        summary.packs_read,
        summary.packs_skipped,
        summary.records
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BLOCK_SIZE;
    use crate::packet::tests::waveform_buffer;
    use crate::packet::PointInterleaved;
    use ndarray::Array2;

    #[test]
    fn test_board_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waves.h5");
        let channels: [Vec<Pulse>; NUMBER_OF_CHANNELS] =
            std::array::from_fn(|c| vec![Pulse::from_slice(&[c as i16; 4]); c + 1]);
        let mut writer = WaveformWriter::new(&path).unwrap();
        writer.write_board(3, &channels).unwrap();
        writer.close().unwrap();

        let file = File::open(&path).unwrap();
        let group = file.group("board_3").unwrap();
        for c in 0..NUMBER_OF_CHANNELS {
            let dset = group.dataset(&format!("channel_{c}")).unwrap();
            let data: Array2<i16> = dset.read_2d().unwrap();
            assert_eq!(data.shape(), &[c + 1, PULSE_LENGTH]);
            assert_eq!(data[[0, 0]], c as i16);
            assert_eq!(data[[0, 4]], 0);
            let board: u32 = dset.attr("board").unwrap().read_scalar().unwrap();
            assert_eq!(board, 3);
        }
    }

    #[test]
    fn test_append_grows_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.h5");
        let mut writer = WaveformWriter::new(&path).unwrap();
        let mut board = writer.board(0).unwrap();
        board.append(2, &[Pulse::from_slice(&[1])]).unwrap();
        board.append(2, &[]).unwrap();
        board.append(2, &vec![Pulse::from_slice(&[2]); 3]).unwrap();
        assert!(matches!(
            board.append(4, &[]),
            Err(HDF5WriterError::BadChannel(4))
        ));
        assert_eq!(board.rows(), [0, 0, 4, 0]);
        writer.close().unwrap();

        let file = File::open(&path).unwrap();
        let group = file.group("board_0").unwrap();
        let data: Array2<i16> = group.dataset("channel_2").unwrap().read_2d().unwrap();
        assert_eq!(data.shape(), &[4, PULSE_LENGTH]);
        assert_eq!(data.column(0).to_vec(), vec![1, 2, 2, 2]);
        let empty: Array2<i16> = group.dataset("channel_0").unwrap().read_2d().unwrap();
        assert_eq!(empty.shape(), &[0, PULSE_LENGTH]);
    }

    #[test]
    fn test_export_appends_each_pack() {
        let dir = tempfile::tempdir().unwrap();
        // one record per channel per pack, channel c tagged with c and the pack index
        let payload_len = PULSE_LENGTH * NUMBER_OF_CHANNELS * 2;
        for pack in 1..=3usize {
            let mut buf = waveform_buffer(payload_len + 2 * BLOCK_SIZE, pack as u16);
            for group in buf[BLOCK_SIZE..BLOCK_SIZE + payload_len].chunks_exact_mut(16) {
                for (pair, channel) in group.chunks_exact_mut(2).zip([3, 3, 2, 2, 0, 0, 1, 1]) {
                    pair.copy_from_slice(&((10 * pack + channel) as i16).to_be_bytes());
                }
            }
            std::fs::write(raw_file_path(dir.path(), 1, pack as u64), &buf).unwrap();
        }

        let path = dir.path().join("packs.h5");
        let mut writer = WaveformWriter::new(&path).unwrap();
        let summary = export_card(&mut writer, dir.path(), 1, &PointInterleaved, true).unwrap();
        writer.close().unwrap();
        assert_eq!(summary.packs_read, 3);
        assert_eq!(summary.records, [3; NUMBER_OF_CHANNELS]);

        let file = File::open(&path).unwrap();
        let group = file.group("board_1").unwrap();
        for c in 0..NUMBER_OF_CHANNELS {
            let data: Array2<i16> = group
                .dataset(&format!("channel_{c}"))
                .unwrap()
                .read_2d()
                .unwrap();
            assert_eq!(data.shape(), &[3, PULSE_LENGTH]);
            for (row, pack) in data.rows().into_iter().zip(1..=3usize) {
                assert!(row.iter().all(|v| *v == (10 * pack + c) as i16));
            }
        }
    }

    #[test]
    fn test_export_card() {
        let dir = tempfile::tempdir().unwrap();
        // payload of two records per channel: 8 samples per group, 2 per channel
        let payload_len = 2 * PULSE_LENGTH * NUMBER_OF_CHANNELS * 2;
        let mut good = waveform_buffer(payload_len + 2 * BLOCK_SIZE, 1);
        for pair in good[BLOCK_SIZE..BLOCK_SIZE + payload_len].chunks_exact_mut(2) {
            pair.copy_from_slice(&7i16.to_be_bytes());
        }
        std::fs::write(raw_file_path(dir.path(), 2, 1), &good).unwrap();
        std::fs::write(raw_file_path(dir.path(), 2, 2), vec![0u8; 64]).unwrap();
        std::fs::write(raw_file_path(dir.path(), 2, 3), &good).unwrap();

        let path = dir.path().join("export.h5");
        let mut writer = WaveformWriter::new(&path).unwrap();
        let summary = export_card(&mut writer, dir.path(), 2, &PointInterleaved, true).unwrap();
        writer.close().unwrap();
        assert_eq!(summary.packs_read, 2);
        assert_eq!(summary.packs_skipped, 1);
        assert_eq!(summary.records, [4; NUMBER_OF_CHANNELS]);

        let file = File::open(&path).unwrap();
        let data: Array2<i16> = file
            .group("board_2")
            .unwrap()
            .dataset("channel_1")
            .unwrap()
            .read_2d()
            .unwrap();
        assert_eq!(data.shape(), &[4, PULSE_LENGTH]);
        assert!(data.iter().all(|v| *v == 7));
    }
}
