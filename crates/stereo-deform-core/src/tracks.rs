//! Tracked stereo correspondences and their per-bin accumulation.
//!
//! Every processed frame transition contributes one [`RelativePose`] and a batch
//! of [`StereoCorrespondence`]s. Each accepted correspondence is appended to the
//! list of the bin containing its left-previous point. Forward-time and
//! reverse-time tracks are kept in two independent [`TrackStream`]s.

use serde::{Deserialize, Serialize};

use crate::{BinGrid, Pt2, Real, RelativePose, TrackError};

/// Camera side of the stereo pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// One feature tracked across one frame transition, seen by both cameras.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoCorrespondence {
    pub left_prev: Pt2,
    pub left_curr: Pt2,
    pub right_prev: Pt2,
    pub right_curr: Pt2,
    /// Number of frames the track has survived.
    pub age: u32,
}

impl StereoCorrespondence {
    pub fn new(left_prev: Pt2, left_curr: Pt2, right_prev: Pt2, right_curr: Pt2, age: u32) -> Self {
        Self {
            left_prev,
            left_curr,
            right_prev,
            right_curr,
            age,
        }
    }

    /// Previous-frame disparity `left_prev.x - right_prev.x`.
    pub fn disparity(&self) -> Real {
        self.left_prev.x - self.right_prev.x
    }
}

/// Bin of each of the four observed points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBins {
    pub left_prev: usize,
    pub left_curr: usize,
    pub right_prev: usize,
    pub right_curr: usize,
}

/// An accepted correspondence together with the frame it belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackEntry {
    pub corr: StereoCorrespondence,
    /// Index into [`TrackStream::poses`].
    pub frame: usize,
    pub bins: RoleBins,
}

/// Which accumulation stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Forward,
    Reverse,
}

/// Counters for accepted and rejected correspondences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub accepted: usize,
    pub out_of_bounds: usize,
    pub non_finite: usize,
    pub degenerate: usize,
}

impl IngestStats {
    pub fn rejected(&self) -> usize {
        self.out_of_bounds + self.non_finite + self.degenerate
    }

    fn record_rejection(&mut self, err: &TrackError) {
        match err {
            TrackError::PointOutOfBounds { .. } => self.out_of_bounds += 1,
            TrackError::NonFinitePoint { .. } => self.non_finite += 1,
            TrackError::DegenerateDisparity { .. } => self.degenerate += 1,
            TrackError::InvalidGrid(_) | TrackError::InvalidIntrinsics(_) => {}
        }
    }

    fn merge(&mut self, other: &IngestStats) {
        self.accepted += other.accepted;
        self.out_of_bounds += other.out_of_bounds;
        self.non_finite += other.non_finite;
        self.degenerate += other.degenerate;
    }
}

/// Per-bin storage for one accumulation direction.
#[derive(Debug, Clone)]
pub struct TrackStream {
    poses: Vec<RelativePose>,
    bins: Vec<Vec<TrackEntry>>,
    stats: IngestStats,
}

impl TrackStream {
    pub fn new(num_bins: usize) -> Self {
        Self {
            poses: Vec::new(),
            bins: vec![Vec::new(); num_bins],
            stats: IngestStats::default(),
        }
    }

    /// Relative pose of every ingested frame, in call order.
    pub fn poses(&self) -> &[RelativePose] {
        &self.poses
    }

    pub fn pose(&self, frame: usize) -> Option<&RelativePose> {
        self.poses.get(frame)
    }

    pub fn num_frames(&self) -> usize {
        self.poses.len()
    }

    /// Entries bucketed into `bin`, in insertion order.
    pub fn bin(&self, bin: usize) -> &[TrackEntry] {
        self.bins.get(bin).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    /// Total number of stored entries.
    pub fn len(&self) -> usize {
        self.bins.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(Vec::is_empty)
    }

    /// All entries, bin by bin, each bin in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackEntry> + '_ {
        self.bins.iter().flatten()
    }

    /// Cumulative ingestion counters.
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.poses.clear();
        self.bins.iter_mut().for_each(Vec::clear);
        self.stats = IngestStats::default();
    }
}

/// Accumulates tracked correspondences into per-bin lists for two streams.
#[derive(Debug, Clone)]
pub struct TrackAccumulator {
    grid: BinGrid,
    min_disparity: Real,
    forward: TrackStream,
    reverse: TrackStream,
}

impl TrackAccumulator {
    /// `min_disparity` is the smallest previous-frame disparity (in pixels)
    /// accepted for triangulation.
    pub fn new(grid: BinGrid, min_disparity: Real) -> Self {
        let num_bins = grid.num_bins();
        Self {
            grid,
            min_disparity,
            forward: TrackStream::new(num_bins),
            reverse: TrackStream::new(num_bins),
        }
    }

    pub fn grid(&self) -> &BinGrid {
        &self.grid
    }

    pub fn min_disparity(&self) -> Real {
        self.min_disparity
    }

    pub fn forward(&self) -> &TrackStream {
        &self.forward
    }

    pub fn reverse(&self) -> &TrackStream {
        &self.reverse
    }

    pub fn stream(&self, kind: StreamKind) -> &TrackStream {
        match kind {
            StreamKind::Forward => &self.forward,
            StreamKind::Reverse => &self.reverse,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.reverse.is_empty()
    }

    /// Ingest one forward-time frame transition.
    pub fn add_forward_frame(
        &mut self,
        correspondences: &[StereoCorrespondence],
        pose: RelativePose,
    ) -> IngestStats {
        self.add_frame(StreamKind::Forward, correspondences, pose)
    }

    /// Ingest one reverse-time frame transition.
    pub fn add_reverse_frame(
        &mut self,
        correspondences: &[StereoCorrespondence],
        pose: RelativePose,
    ) -> IngestStats {
        self.add_frame(StreamKind::Reverse, correspondences, pose)
    }

    /// Ingest one frame into the selected stream and return this frame's counters.
    ///
    /// Invalid correspondences are skipped individually; the frame pose is
    /// recorded even if nothing is accepted.
    pub fn add_frame(
        &mut self,
        kind: StreamKind,
        correspondences: &[StereoCorrespondence],
        pose: RelativePose,
    ) -> IngestStats {
        let grid = self.grid;
        let min_disparity = self.min_disparity;
        let stream = match kind {
            StreamKind::Forward => &mut self.forward,
            StreamKind::Reverse => &mut self.reverse,
        };

        let frame = stream.poses.len();
        stream.poses.push(pose);

        let mut frame_stats = IngestStats::default();
        for corr in correspondences {
            match validate_correspondence(&grid, min_disparity, corr) {
                Ok(bins) => {
                    stream.bins[bins.left_prev].push(TrackEntry {
                        corr: *corr,
                        frame,
                        bins,
                    });
                    frame_stats.accepted += 1;
                }
                Err(err) => {
                    log::debug!("{:?} frame {}: skipping correspondence: {}", kind, frame, err);
                    frame_stats.record_rejection(&err);
                }
            }
        }
        stream.stats.merge(&frame_stats);

        log::debug!(
            "{:?} frame {}: accepted {} of {} correspondences",
            kind,
            frame,
            frame_stats.accepted,
            correspondences.len()
        );
        frame_stats
    }

    /// Drop all accumulated frames from both streams.
    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }
}

/// Check that all four points lie in the image and that the previous-frame
/// disparity is usable, returning the bin of each point.
pub fn validate_correspondence(
    grid: &BinGrid,
    min_disparity: Real,
    corr: &StereoCorrespondence,
) -> Result<RoleBins, TrackError> {
    let bins = RoleBins {
        left_prev: grid.bin_of(&corr.left_prev)?,
        left_curr: grid.bin_of(&corr.left_curr)?,
        right_prev: grid.bin_of(&corr.right_prev)?,
        right_curr: grid.bin_of(&corr.right_curr)?,
    };
    let disparity = corr.disparity();
    // Written so that a NaN disparity is also rejected.
    if !(disparity >= min_disparity) {
        return Err(TrackError::DegenerateDisparity {
            disparity,
            min: min_disparity,
        });
    }
    Ok(bins)
}
