//! Translation template extraction from source branches.

use buildfarm_core::artifact::ArtifactRef;
use buildfarm_core::build::{Build, BuildSpec, FileRef};
use buildfarm_core::job::JobType;
use buildfarm_core::worker::Worker;
use buildfarm_core::{Error, Result};
use serde_json::{Map, Value};
use std::time::Duration;

use super::BuildBehavior;

/// Fixed score, just above a main/release package build.
const TEMPLATES_SCORE: i32 = 2510;

#[derive(Debug, Default, Clone, Copy)]
pub struct TranslationTemplatesBehavior;

impl BuildBehavior for TranslationTemplatesBehavior {
    fn job_type(&self) -> JobType {
        JobType::TranslationTemplatesBuild
    }

    fn verify_build_request(&self, build: &Build, worker: &Worker) -> Result<()> {
        let BuildSpec::TranslationTemplates(spec) = &build.spec else {
            return Err(Error::Internal("not a translation templates build".to_string()));
        };
        // Branches are arbitrary code.
        if !worker.virtualized {
            return Err(Error::BuildRejected(format!(
                "translation templates build on non-virtual worker {}",
                worker.name
            )));
        }
        if spec.chroot.is_none() {
            return Err(Error::BuildRejected(format!(
                "missing chroot for {}/{}",
                spec.series, spec.arch_tag
            )));
        }
        Ok(())
    }

    fn build_arguments(&self, build: &Build) -> Result<Map<String, Value>> {
        let BuildSpec::TranslationTemplates(spec) = &build.spec else {
            return Err(Error::Internal("not a translation templates build".to_string()));
        };
        let mut args = Map::new();
        args.insert("arch_tag".to_string(), spec.arch_tag.clone().into());
        args.insert("branch_url".to_string(), spec.branch_url.clone().into());
        args.insert("series".to_string(), spec.series.clone().into());
        Ok(args)
    }

    fn input_files(&self, _build: &Build) -> Vec<FileRef> {
        Vec::new()
    }

    fn max_silence(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn score(&self, _spec: &BuildSpec) -> i32 {
        TEMPLATES_SCORE
    }

    fn verify_upload(&self, _build: &Build, files: &[ArtifactRef]) -> Result<()> {
        match files {
            [tarball] if tarball.name.ends_with(".tar.gz") => Ok(()),
            _ => Err(Error::Upload(format!(
                "expected one templates tarball, got {} files",
                files.len()
            ))),
        }
    }
}
