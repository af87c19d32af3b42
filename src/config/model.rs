// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

/// Top-level workflow description as read from a TOML file.
///
/// ```toml
/// [settings]
/// poll_interval_secs = 30
/// max_retries = 3
///
/// [bundle]
/// capacity_nodes = 32
/// queue = "normal"
/// walltime = "48:00:00"
///
/// [job.si-scf]
/// workdir = "runs/si"
///
/// [[job.si-scf.stage]]
/// name = "scf"
/// nodes = 16
/// command = "mpirun -n 512 engine < scf.in > scf.in.o"
/// input_file = "scf.in"
/// output_file = "scf.in.o"
/// input_lines = ["kpoints 2 2 2", "tolerance 1e-10"]
/// done_marker = "All_done"
///
/// [[job.si-scf.stage]]
/// name = "dmc"
/// command = "mpirun -n 512 qmc < dmc.in > dmc.in.o"
/// input_file = "dmc.in"
/// output_file = "dmc.in.o"
/// input_lines = ["trialfunc {k0}"]
/// done_marker = "total energy"
/// needs = [{ stage = "scf", channel = "k0" }]
/// ```
///
/// All sections are optional except the jobs themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    /// Driver behaviour from `[settings]`.
    #[serde(default)]
    pub settings: SettingsSection,

    /// Shared batch-allocation parameters from `[bundle]`.
    #[serde(default)]
    pub bundle: BundleSection,

    /// All jobs from `[job.<id>]`. Keys are the job identifiers.
    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,
}

/// `[settings]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsSection {
    /// Seconds between tick cycles in the polling loop.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How many times a killed run may be remediated and resubmitted before
    /// the stage is reported as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// `[bundle]` section: how ready stages are packed into shared allocations
/// and what the rendered submission script declares to the queue.
#[derive(Debug, Clone, Deserialize)]
pub struct BundleSection {
    /// Node budget of one shared allocation. A single stage requesting more
    /// than this is submitted alone.
    #[serde(default = "default_capacity_nodes")]
    pub capacity_nodes: u32,

    /// Queue (partition) name passed to the batch system.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Wall-clock limit in the batch system's own format.
    #[serde(default = "default_walltime")]
    pub walltime: String,

    /// Processors per node.
    #[serde(default = "default_ppn")]
    pub ppn: u32,

    /// Accounting project, if the cluster requires one.
    #[serde(default)]
    pub account: Option<String>,

    /// Base name for submitted allocations; a counter is appended per bundle.
    #[serde(default = "default_jobname")]
    pub jobname: String,

    /// Shell lines inserted once at the top of every rendered script.
    #[serde(default)]
    pub prologue: Vec<String>,

    /// Shell lines appended once at the bottom, after the trailing `wait`.
    #[serde(default)]
    pub epilogue: Vec<String>,

    /// Directory the rendered `.qsub` scripts are written to.
    #[serde(default = "default_script_dir")]
    pub script_dir: String,
}

fn default_capacity_nodes() -> u32 {
    16
}

fn default_queue() -> String {
    "normal".to_string()
}

fn default_walltime() -> String {
    "48:00:00".to_string()
}

fn default_ppn() -> u32 {
    32
}

fn default_jobname() -> String {
    "stagehand".to_string()
}

fn default_script_dir() -> String {
    ".".to_string()
}

impl Default for BundleSection {
    fn default() -> Self {
        Self {
            capacity_nodes: default_capacity_nodes(),
            queue: default_queue(),
            walltime: default_walltime(),
            ppn: default_ppn(),
            account: None,
            jobname: default_jobname(),
            prologue: Vec::new(),
            epilogue: Vec::new(),
            script_dir: default_script_dir(),
        }
    }
}

/// `[job.<id>]` section: one calculation pipeline, one directory tree.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Root directory for the job. Each stage owns the subdirectory
    /// `<workdir>/<stage name>` unless it overrides `workdir` itself.
    pub workdir: String,

    /// Ordered stages from `[[job.<id>.stage]]`.
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageConfig>,
}

/// `[[job.<id>.stage]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Stage name, unique within the job. Also keys the checkpoint file.
    pub name: String,

    /// Optional explicit working directory (relative paths resolve against
    /// the job `workdir`). Defaults to `<job workdir>/<name>`.
    #[serde(default)]
    pub workdir: Option<String>,

    /// Declared node requirement, consumed by the bundler.
    #[serde(default = "default_nodes")]
    pub nodes: u32,

    /// Execution command staged for the shared allocation, run from the
    /// stage's working directory.
    pub command: String,

    /// Name of the input artifact the writer materializes.
    pub input_file: String,

    /// Name of the output artifact whose existence marks the run as started
    /// and whose content the reader collects.
    pub output_file: String,

    /// Lines rendered into the input artifact. Placeholders of the form
    /// `{channel}` are replaced with the artifact paths pulled from the
    /// producer exporting that channel.
    #[serde(default)]
    pub input_lines: Vec<String>,

    /// Lines appended to the input on each remediation attempt (e.g. a level
    /// shift or looser start guess). Applied cumulatively, once per attempt.
    #[serde(default)]
    pub retry_lines: Vec<String>,

    /// Regex recognized in the output as the success marker.
    pub done_marker: String,

    /// Optional regex recognized as an explicit failure marker; a finished
    /// run matching neither marker is treated as killed regardless.
    #[serde(default)]
    pub killed_marker: Option<String>,

    /// Named export channels: channel -> artifact file names relative to the
    /// stage's working directory.
    #[serde(default)]
    pub exports: BTreeMap<String, Vec<String>>,

    /// Pull-based dependencies on producer stages within the same job.
    #[serde(default)]
    pub needs: Vec<NeedConfig>,

    /// Shell lines staged before this stage's command in the bundle script.
    #[serde(default)]
    pub prologue: Vec<String>,

    /// Shell lines staged after this stage's command in the bundle script.
    #[serde(default)]
    pub epilogue: Vec<String>,
}

fn default_nodes() -> u32 {
    1
}

/// One `{ stage = "...", channel = "..." }` dependency entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NeedConfig {
    pub stage: String,
    pub channel: String,
}
