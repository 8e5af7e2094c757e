//! # wedge_integrator
//!
//! wedge_integrator follows a rotation data collection as the images are written
//! and integrates it with XDS while it happens, written in Rust. Every ten degrees
//! of data a wedge is integrated in the background so the quality of the crystal
//! is known long before the collection ends. Once the last image arrives (or the
//! images stop arriving) the whole sweep is integrated, cut at the resolution the
//! data support, polished with its own refined geometry, scaled with
//! pointless/aimless and turned into the usual deliverables.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before,
//! see the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions. To build and install the CLI use
//! `cargo install --path ./wedge_integrator_cli` from the top level of the
//! repository.
//!
//! The external programs must be on the `PATH` of the machine running the
//! integrator (and of the cluster nodes, when a cluster is used): `xds_par`
//! (or the configured program), `xdsstat`, `pointless`, `aimless`, `truncate`,
//! `freerflag`, `mtz2various` and `tar`. RAM staged collections also need
//! passwordless `ssh` to the nodes.
//!
//! ## Configuration
//!
//! One YAML file describes one dataset. A template can be made with
//! `wedge_integrator_cli -p template.yml new`. The sections are
//!
//! - `command`: `total_on_disk`, `incremental` or `ram_distributed`
//! - `work_directory`: where the wedges, results and archives are written
//! - `detector_defaults_directory`: holds the `XDS-<detector>.INP` default files
//! - `run`: detector, beam center, distance, wavelength, oscillation, two-theta,
//!   first image, image count, exposure time, image directory and prefix
//! - `preferences`: space group, resolution limits, target signal/noise, cluster
//!   use, RAM staging and cleanup
//! - `execution`: site settings such as the XDS program and the cluster command
//!
//! Boolean preferences may be written as `true`/`false`, `"True"`/`"False"` or
//! `yes`/`no`.
//!
//! ## Output
//!
//! ```text
//! work_directory
//! |---- wedge_<first>_<last>      one per wedge, each with XDS.INP, logs and results.yml
//! |---- final_<first>_<last>      the final pass over everything collected
//! |---- <prefix>_<run>            deliverables and the final results.yml
//! |---- <prefix>_<run>.tar.bz2
//! |---- xds_lp_files.tar.bz2
//! ```
pub mod aimless_log;
pub mod config;
pub mod constants;
pub mod detector;
pub mod error;
pub mod error_classifier;
pub mod file_watcher;
pub mod finalize;
pub mod integration;
pub mod job_file;
pub mod orientation;
pub mod pointless_log;
pub mod process;
pub mod resolution;
pub mod results;
pub mod run_spec;
pub mod symmetry;
pub mod tool;
pub mod wedge_scheduler;
pub mod worker_status;
pub mod xds_log;
pub mod xdsstat_log;
