//! Fixtures shared by the store tests.

use buildfarm_core::build::{
    Archive, ArchivePurpose, BinaryPackageSpec, BuildSpec, Pocket, SeriesStatus,
};
use buildfarm_core::worker::NewWorker;

use crate::store::NewBuild;

pub fn new_worker(name: &str, virtualized: bool) -> NewWorker {
    NewWorker {
        name: name.to_string(),
        url: format!("http://{}:8221", name),
        processor: "386".to_string(),
        virtualized,
        vm_host: virtualized.then(|| "host1".to_string()),
        manual: false,
        active: true,
    }
}

pub fn package_build(processor: &str, virtualized: bool, score: i32) -> NewBuild {
    NewBuild {
        spec: BuildSpec::BinaryPackage(BinaryPackageSpec {
            source_name: "hello".to_string(),
            version: "2.10-1".to_string(),
            series: "noble".to_string(),
            series_status: SeriesStatus::Development,
            arch_tag: "i386".to_string(),
            processor: processor.to_string(),
            arch_indep: false,
            pocket: Pocket::Release,
            component: "main".to_string(),
            archive: Archive {
                name: "primary".to_string(),
                purpose: ArchivePurpose::Primary,
                private: false,
                require_virtualized: virtualized,
                enabled: true,
                build_debug_symbols: false,
                relative_build_score: 0,
            },
            archives: Vec::new(),
            chroot: None,
            files: Vec::new(),
        }),
        score,
        requesting_principal: None,
    }
}
