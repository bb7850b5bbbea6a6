//! Build records and their lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;
use crate::job::JobType;
use crate::{BuildId, WorkerId};

/// Lifecycle status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    NeedsBuild,
    Building,
    Uploading,
    FullyBuilt,
    FailedToBuild,
    FailedToUpload,
    ManualDepWait,
    ChrootWait,
    Superseded,
    Cancelling,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::NeedsBuild => "NEEDSBUILD",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Uploading => "UPLOADING",
            BuildStatus::FullyBuilt => "FULLYBUILT",
            BuildStatus::FailedToBuild => "FAILEDTOBUILD",
            BuildStatus::FailedToUpload => "FAILEDTOUPLOAD",
            BuildStatus::ManualDepWait => "MANUALDEPWAIT",
            BuildStatus::ChrootWait => "CHROOTWAIT",
            BuildStatus::Superseded => "SUPERSEDED",
            BuildStatus::Cancelling => "CANCELLING",
            BuildStatus::Cancelled => "CANCELLED",
        }
    }

    /// Statuses after which the build no longer occupies a worker.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            BuildStatus::FullyBuilt
                | BuildStatus::FailedToBuild
                | BuildStatus::FailedToUpload
                | BuildStatus::ManualDepWait
                | BuildStatus::ChrootWait
                | BuildStatus::Superseded
                | BuildStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let status = match s {
            "NEEDSBUILD" => BuildStatus::NeedsBuild,
            "BUILDING" => BuildStatus::Building,
            "UPLOADING" => BuildStatus::Uploading,
            "FULLYBUILT" => BuildStatus::FullyBuilt,
            "FAILEDTOBUILD" => BuildStatus::FailedToBuild,
            "FAILEDTOUPLOAD" => BuildStatus::FailedToUpload,
            "MANUALDEPWAIT" => BuildStatus::ManualDepWait,
            "CHROOTWAIT" => BuildStatus::ChrootWait,
            "SUPERSEDED" => BuildStatus::Superseded,
            "CANCELLING" => BuildStatus::Cancelling,
            "CANCELLED" => BuildStatus::Cancelled,
            other => {
                return Err(crate::Error::InvalidInput(format!(
                    "unknown build status: {}",
                    other
                )));
            }
        };
        Ok(status)
    }
}

/// A file stored in the librarian, referenced by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub filename: String,
    /// Hex SHA-256 of the content.
    pub content_hash: String,
    /// Public download URL.
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchivePurpose {
    Primary,
    Partner,
    Ppa,
    Copy,
}

impl ArchivePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchivePurpose::Primary => "PRIMARY",
            ArchivePurpose::Partner => "PARTNER",
            ArchivePurpose::Ppa => "PPA",
            ArchivePurpose::Copy => "COPY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub name: String,
    pub purpose: ArchivePurpose,
    pub private: bool,
    /// Builds for this archive must run on virtualized workers.
    pub require_virtualized: bool,
    pub enabled: bool,
    pub build_debug_symbols: bool,
    /// Added to the score of every build in this archive.
    pub relative_build_score: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pocket {
    Release,
    Security,
    Updates,
    Proposed,
    Backports,
}

impl Pocket {
    /// Suffix appended to the series name to form the suite.
    pub fn suffix(&self) -> &'static str {
        match self {
            Pocket::Release => "",
            Pocket::Security => "-security",
            Pocket::Updates => "-updates",
            Pocket::Proposed => "-proposed",
            Pocket::Backports => "-backports",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeriesStatus {
    Experimental,
    Development,
    Frozen,
    Current,
    Supported,
    Obsolete,
}

impl SeriesStatus {
    /// Released series only accept uploads to post-release pockets.
    pub fn is_released(&self) -> bool {
        matches!(
            self,
            SeriesStatus::Current | SeriesStatus::Supported | SeriesStatus::Obsolete
        )
    }
}

/// What a binary package build compiles and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryPackageSpec {
    pub source_name: String,
    pub version: String,
    pub series: String,
    pub series_status: SeriesStatus,
    pub arch_tag: String,
    /// Processor the architecture runs on, e.g. "386" for i386.
    pub processor: String,
    /// This architecture also builds architecture-independent packages.
    pub arch_indep: bool,
    pub pocket: Pocket,
    pub component: String,
    pub archive: Archive,
    /// sources.list lines the worker should build against.
    pub archives: Vec<String>,
    pub chroot: Option<FileRef>,
    pub files: Vec<FileRef>,
}

/// Extraction of translation templates from a source branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationTemplatesSpec {
    pub branch_url: String,
    pub series: String,
    pub arch_tag: String,
    pub chroot: Option<FileRef>,
}

/// Job-type-specific part of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildSpec {
    BinaryPackage(BinaryPackageSpec),
    TranslationTemplates(TranslationTemplatesSpec),
}

impl BuildSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            BuildSpec::BinaryPackage(_) => JobType::PackageBuild,
            BuildSpec::TranslationTemplates(_) => JobType::TranslationTemplatesBuild,
        }
    }

    pub fn chroot(&self) -> Option<&FileRef> {
        match self {
            BuildSpec::BinaryPackage(spec) => spec.chroot.as_ref(),
            BuildSpec::TranslationTemplates(spec) => spec.chroot.as_ref(),
        }
    }

    /// Processor a worker must have, `None` when any will do.
    pub fn processor(&self) -> Option<&str> {
        match self {
            BuildSpec::BinaryPackage(spec) => Some(&spec.processor),
            BuildSpec::TranslationTemplates(_) => None,
        }
    }

    /// Virtualization a worker must have, `None` for no preference.
    pub fn required_virtualization(&self) -> Option<bool> {
        match self {
            BuildSpec::BinaryPackage(spec) => Some(spec.archive.require_virtualized),
            BuildSpec::TranslationTemplates(_) => None,
        }
    }

    pub fn arch_tag(&self) -> &str {
        match self {
            BuildSpec::BinaryPackage(spec) => &spec.arch_tag,
            BuildSpec::TranslationTemplates(spec) => &spec.arch_tag,
        }
    }

    /// Whether inputs and outputs of this build are access-restricted.
    pub fn is_private(&self) -> bool {
        match self {
            BuildSpec::BinaryPackage(spec) => spec.archive.private,
            BuildSpec::TranslationTemplates(_) => false,
        }
    }
}

/// One attempt to produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub status: BuildStatus,
    /// Current or last worker.
    pub builder: Option<WorkerId>,
    pub failure_count: u32,
    /// Unsatisfied dependencies reported by a DEPFAIL.
    pub dependencies: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
    pub log: Option<ArtifactRef>,
    pub files: Vec<ArtifactRef>,
    pub spec: BuildSpec,
}

impl Build {
    pub fn job_type(&self) -> JobType {
        self.spec.job_type()
    }

    pub fn title(&self) -> String {
        match &self.spec {
            BuildSpec::BinaryPackage(spec) => format!(
                "{} build of {} {} in {} {}",
                spec.arch_tag, spec.source_name, spec.version, spec.archive.name, spec.series
            ),
            BuildSpec::TranslationTemplates(spec) => {
                format!("Translation template build for {}", spec.branch_url)
            }
        }
    }

    pub fn can_be_cancelled(&self) -> bool {
        matches!(self.status, BuildStatus::NeedsBuild | BuildStatus::Building)
    }

    pub fn can_be_retried(&self) -> bool {
        matches!(
            self.status,
            BuildStatus::FailedToBuild
                | BuildStatus::ManualDepWait
                | BuildStatus::ChrootWait
                | BuildStatus::FailedToUpload
                | BuildStatus::Cancelled
        )
    }

    pub fn can_be_rescored(&self) -> bool {
        self.status == BuildStatus::NeedsBuild
    }

    /// Reset the build so it can be queued again.
    pub fn reset_for_retry(&mut self) {
        self.status = BuildStatus::NeedsBuild;
        self.builder = None;
        self.date_started = None;
        self.date_finished = None;
        self.log = None;
        self.files.clear();
        self.dependencies = None;
        self.failure_count = 0;
    }
}

#[cfg(test)]
pub(crate) fn sample_build(id: i64, private: bool) -> Build {
    Build {
        id: BuildId::new(id),
        status: BuildStatus::NeedsBuild,
        builder: None,
        failure_count: 0,
        dependencies: None,
        date_created: Utc::now(),
        date_started: None,
        date_finished: None,
        log: None,
        files: Vec::new(),
        spec: BuildSpec::BinaryPackage(BinaryPackageSpec {
            source_name: "hello".to_string(),
            version: "2.10-1".to_string(),
            series: "noble".to_string(),
            series_status: SeriesStatus::Development,
            arch_tag: "i386".to_string(),
            processor: "386".to_string(),
            arch_indep: true,
            pocket: Pocket::Release,
            component: "main".to_string(),
            archive: Archive {
                name: "primary".to_string(),
                purpose: ArchivePurpose::Primary,
                private,
                require_virtualized: false,
                enabled: true,
                build_debug_symbols: false,
                relative_build_score: 0,
            },
            archives: Vec::new(),
            chroot: None,
            files: Vec::new(),
        }),
    }
}
