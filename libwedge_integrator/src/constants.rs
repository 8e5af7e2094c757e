// Values tied to the behaviour of the external tools or to beamline practice.
// Anything site specific lives in the Config instead.

/// Angular extent of one incremental wedge, in degrees
pub const WEDGE_TARGET_DEGREES: f64 = 10.0;
/// Wedge size used when the oscillation increment cannot give one
pub const FALLBACK_WEDGE_SIZE: u32 = 10;

/// Interval between image existence checks
pub const IMAGE_POLL_INTERVAL_MS: u64 = 250;
/// Extra existence checks after a wait expires (network filesystem lag)
pub const IMAGE_RECHECKS: u32 = 2;
/// Pause between the extra existence checks
pub const IMAGE_RECHECK_PAUSE_MS: u64 = 500;
/// Images past a missing one that are probed before declaring an abort
pub const ABORT_LOOKAHEAD: u32 = 2;

/// Number of images after the first used for the background range
pub const BACKGROUND_RANGE_SPAN: u32 = 4;
/// Spot ranges for indexing cover this many degrees
pub const SPOT_RANGE_DEGREES: f64 = 5.0;
/// Second spot range starts this far into the sweep when the sweep allows it
pub const SPOT_RANGE_SEPARATION_DEGREES: f64 = 90.0;
/// Sweeps shorter than this use the middle of the sweep for the second spot range
pub const SPOT_RANGE_SEPARATION_LIMIT_DEGREES: f64 = 95.0;
/// The whole sweep is a single spot range at or below this width
pub const SINGLE_SPOT_RANGE_DEGREES: f64 = 10.0;

/// Default profile parameters injected when XDS cannot determine spot size
pub const DEFAULT_REFLECTING_RANGE: &str = "REFLECTING_RANGE=1.0 REFLECTING_RANGE_E.S.D.=0.10";
pub const DEFAULT_BEAM_DIVERGENCE: &str = "BEAM_DIVERGENCE=0.9 BEAM_DIVERGENCE_E.S.D.=0.09";

/// Low resolution limit written with every resolution range directive
pub const LOW_RESOLUTION_LIMIT: f64 = 200.0;
/// Cutoffs at or better than this are safe to polish
pub const POLISH_SAFE_RESOLUTION: f64 = 4.5;
/// Aimless is rerun when its suggestion beats the applied limit by more than this
pub const AIMLESS_RERUN_MARGIN: f64 = 0.05;

/// Minimum number of images per integration batch, in degrees of rotation
pub const MIN_BATCH_DEGREES: f64 = 5.0;

// File names fixed by XDS
pub const XDS_INPUT: &str = "XDS.INP";
pub const XDS_LOG: &str = "XDS.LOG";
pub const CORRECT_LP: &str = "CORRECT.LP";
pub const INTEGRATE_LP: &str = "INTEGRATE.LP";
pub const IDXREF_LP: &str = "IDXREF.LP";
pub const GXPARM: &str = "GXPARM.XDS";
pub const XPARM: &str = "XPARM.XDS";
pub const XDS_ASCII: &str = "XDS_ASCII.HKL";
pub const XDSSTAT_LP: &str = "XDSSTAT.LP";

/// Name of the YAML record written next to every set of results
pub const RESULTS_FILE: &str = "results.yml";
pub const WEDGE_DIR_PREFIX: &str = "wedge_";
pub const FINAL_DIR_PREFIX: &str = "final_";
/// Directory collecting every LP file before archiving
pub const LP_ARCHIVE_DIR: &str = "xds_lp_files";
/// Where staged images live on the compute nodes
pub const RAM_STAGING_ROOT: &str = "/dev/shm";
