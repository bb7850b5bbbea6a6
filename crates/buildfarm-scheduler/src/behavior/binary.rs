//! Binary package builds.

use buildfarm_core::artifact::ArtifactRef;
use buildfarm_core::build::{
    ArchivePurpose, BinaryPackageSpec, Build, BuildSpec, FileRef, Pocket,
};
use buildfarm_core::job::{Candidate, JobType};
use buildfarm_core::worker::Worker;
use buildfarm_core::{Error, Result};
use serde_json::{Map, Value, json};
use std::time::Duration;

use super::{BuildBehavior, CandidateFilter};

const PRIVATE_ARCHIVE_SCORE_BONUS: i32 = 10000;
const COPY_ARCHIVE_SCORE_PENALTY: i32 = 2600;

fn pocket_score(pocket: Pocket) -> i32 {
    match pocket {
        Pocket::Backports => 0,
        Pocket::Release => 1500,
        Pocket::Proposed => 3000,
        Pocket::Updates => 3000,
        Pocket::Security => 4500,
    }
}

fn component_score(component: &str) -> i32 {
    match component {
        "partner" => 1250,
        "main" => 1000,
        "restricted" => 750,
        "universe" => 250,
        _ => 0,
    }
}

/// Whether the archive accepts builds for the spec's pocket in its series.
fn check_pocket(spec: &BinaryPackageSpec) -> std::result::Result<(), String> {
    let released = spec.series_status.is_released();
    match spec.archive.purpose {
        ArchivePurpose::Primary | ArchivePurpose::Partner => {
            if released && spec.pocket == Pocket::Release {
                return Err(format!(
                    "{} is released; its release pocket is closed",
                    spec.series
                ));
            }
            if !released && matches!(spec.pocket, Pocket::Updates | Pocket::Backports) {
                return Err(format!(
                    "{} is not released; {:?} is not open yet",
                    spec.series, spec.pocket
                ));
            }
            Ok(())
        }
        ArchivePurpose::Ppa if spec.pocket != Pocket::Release => Err(format!(
            "PPA {} only builds for the release pocket",
            spec.archive.name
        )),
        ArchivePurpose::Ppa | ArchivePurpose::Copy => Ok(()),
    }
}

fn binary_spec(build: &Build) -> Result<&BinaryPackageSpec> {
    match &build.spec {
        BuildSpec::BinaryPackage(spec) => Ok(spec),
        other => Err(Error::Internal(format!(
            "binary package behaviour given a {} build",
            other.job_type()
        ))),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryPackageBehavior;

impl BuildBehavior for BinaryPackageBehavior {
    fn job_type(&self) -> JobType {
        JobType::PackageBuild
    }

    fn refine_candidates(&self, _processor: &str, _virtualized: bool) -> Option<CandidateFilter> {
        // Builds for disabled archives stay queued until the archive is
        // enabled again.
        Some(Box::new(|candidate: &Candidate| match &candidate.build.spec {
            BuildSpec::BinaryPackage(spec) => spec.archive.enabled,
            _ => true,
        }))
    }

    fn post_selection_approve(&self, candidate: &Candidate, _worker: &Worker) -> bool {
        match &candidate.build.spec {
            BuildSpec::BinaryPackage(spec) => check_pocket(spec).is_ok(),
            _ => false,
        }
    }

    fn verify_build_request(&self, build: &Build, worker: &Worker) -> Result<()> {
        let spec = binary_spec(build)?;

        if spec.archive.require_virtualized && !worker.virtualized {
            return Err(Error::BuildRejected(format!(
                "attempt to build virtual archive {} on non-virtual worker {}",
                spec.archive.name, worker.name
            )));
        }
        if spec.chroot.is_none() {
            return Err(Error::BuildRejected(format!(
                "missing chroot for {}/{}",
                spec.series, spec.arch_tag
            )));
        }
        if spec.pocket == Pocket::Security {
            return Err(Error::BuildRejected(
                "security uploads are not built on the farm".to_string(),
            ));
        }
        check_pocket(spec).map_err(Error::BuildRejected)
    }

    fn build_arguments(&self, build: &Build) -> Result<Map<String, Value>> {
        let spec = binary_spec(build)?;
        let args = json!({
            "arch_indep": spec.arch_indep,
            "arch_tag": spec.arch_tag,
            "archive_private": spec.archive.private,
            "archive_purpose": spec.archive.purpose.as_str(),
            "archives": spec.archives,
            "build_debug_symbols": spec.archive.build_debug_symbols,
            "ogrecomponent": spec.component,
            "series": spec.series,
            "suite": format!("{}{}", spec.series, spec.pocket.suffix()),
        });
        match args {
            Value::Object(map) => Ok(map),
            _ => Err(Error::Internal("build arguments are not an object".to_string())),
        }
    }

    fn input_files(&self, build: &Build) -> Vec<FileRef> {
        match &build.spec {
            BuildSpec::BinaryPackage(spec) => spec.files.clone(),
            _ => Vec::new(),
        }
    }

    fn max_silence(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    fn score(&self, spec: &BuildSpec) -> i32 {
        let BuildSpec::BinaryPackage(spec) = spec else {
            return 0;
        };
        let mut score = pocket_score(spec.pocket) + component_score(&spec.component);
        if spec.archive.private {
            score += PRIVATE_ARCHIVE_SCORE_BONUS;
        }
        if spec.archive.purpose == ArchivePurpose::Copy {
            score -= COPY_ARCHIVE_SCORE_PENALTY;
        }
        score + spec.archive.relative_build_score
    }

    fn verify_upload(&self, build: &Build, files: &[ArtifactRef]) -> Result<()> {
        if files.is_empty() {
            return Err(Error::Upload(format!("{} produced no files", build.title())));
        }
        if let Some(bad) = files
            .iter()
            .find(|f| f.name.is_empty() || f.name.contains('/') || f.name.starts_with('.'))
        {
            return Err(Error::Upload(format!("refusing file name {:?}", bad.name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{package_spec, sample_worker};
    use buildfarm_core::build::SeriesStatus;

    fn build_of(spec: BinaryPackageSpec) -> Build {
        crate::testing::build_from(BuildSpec::BinaryPackage(spec))
    }

    #[test]
    fn test_arguments() {
        let mut spec = package_spec(true, false);
        spec.pocket = Pocket::Proposed;
        spec.archives = vec!["deb http://archive noble main".to_string()];
        let args = BinaryPackageBehavior.build_arguments(&build_of(spec)).unwrap();

        assert_eq!(args["suite"], "noble-proposed");
        assert_eq!(args["arch_tag"], "i386");
        assert_eq!(args["archive_purpose"], "PRIMARY");
        assert_eq!(args["ogrecomponent"], "main");
        assert_eq!(args["archive_private"], false);
        assert_eq!(args["archives"][0], "deb http://archive noble main");
    }

    #[test]
    fn test_verify_rejects_missing_chroot() {
        let mut spec = package_spec(true, false);
        spec.chroot = None;
        let err = BinaryPackageBehavior
            .verify_build_request(&build_of(spec), &sample_worker(true))
            .unwrap_err();
        assert!(matches!(err, Error::BuildRejected(msg) if msg.contains("chroot")));
    }

    #[test]
    fn test_verify_rejects_virtual_archive_on_native_worker() {
        let spec = package_spec(true, false);
        assert!(
            BinaryPackageBehavior
                .verify_build_request(&build_of(spec), &sample_worker(false))
                .is_err()
        );
    }

    #[test]
    fn test_verify_rejects_security_and_closed_pockets() {
        let worker = sample_worker(true);

        let mut spec = package_spec(true, false);
        spec.pocket = Pocket::Security;
        assert!(
            BinaryPackageBehavior
                .verify_build_request(&build_of(spec), &worker)
                .is_err()
        );

        let mut spec = package_spec(true, false);
        spec.series_status = SeriesStatus::Current;
        assert!(
            BinaryPackageBehavior
                .verify_build_request(&build_of(spec), &worker)
                .is_err()
        );

        let mut spec = package_spec(true, false);
        spec.series_status = SeriesStatus::Current;
        spec.pocket = Pocket::Updates;
        BinaryPackageBehavior
            .verify_build_request(&build_of(spec), &worker)
            .unwrap();
    }

    #[test]
    fn test_refinement_skips_disabled_archives() {
        let mut spec = package_spec(true, false);
        spec.archive.enabled = false;
        let candidate = crate::testing::candidate_from(build_of(spec));

        let filter = BinaryPackageBehavior.refine_candidates("386", true).unwrap();
        assert!(!filter(&candidate));
    }

    #[test]
    fn test_score() {
        let spec = package_spec(true, false);
        assert_eq!(
            BinaryPackageBehavior.score(&BuildSpec::BinaryPackage(spec.clone())),
            2500
        );

        let mut private = spec.clone();
        private.archive.private = true;
        private.archive.relative_build_score = 5;
        assert_eq!(
            BinaryPackageBehavior.score(&BuildSpec::BinaryPackage(private)),
            12505
        );

        let mut copy = spec;
        copy.archive.purpose = ArchivePurpose::Copy;
        assert_eq!(
            BinaryPackageBehavior.score(&BuildSpec::BinaryPackage(copy)),
            -100
        );
    }
}
