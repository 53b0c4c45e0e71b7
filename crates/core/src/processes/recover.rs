//! Restoring an old version of a file next to the current one.

use crate::model::meta_file::{FileVersion, MetaFile};
use crate::processes::common::{download_version, fetch_meta_file, relative_to_root};
use crate::session::Session;
use meshvault_crypto::KeyPair;
use meshvault_process::{
    CancelToken, ProcessStep, SequentialProcess, StepError, WithResult,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// UI boundary: picks the version to restore and names the recovered copy.
pub trait VersionSelector: Send + Sync {
    /// Pick a version from the presented list, or `None` to abort.
    fn select(&self, versions: &[FileVersion]) -> Option<usize>;

    /// Name of the recovered file placed next to the original.
    fn recovered_name(&self, original: &str, version_index: usize) -> String {
        match original.rsplit_once('.') {
            Some((stem, extension)) => format!("{stem}_v{version_index}.{extension}"),
            None => format!("{original}_v{version_index}"),
        }
    }
}

#[derive(Default)]
struct RecoverContext {
    relative: PathBuf,
    node_keys: Option<KeyPair>,
    meta_file: Option<MetaFile>,
    selected: Option<usize>,
    destination: Option<PathBuf>,
}

/// Build the recover pipeline. The typed result carries the path of the
/// recovered copy. The profile is never mutated.
pub fn recover_file_process(
    session: Arc<Session>,
    path: PathBuf,
    selector: Arc<dyn VersionSelector>,
) -> WithResult<PathBuf> {
    let context = Arc::new(Mutex::new(RecoverContext::default()));

    let mut process = SequentialProcess::new("recover file");
    process
        .add_step(FindIndexStep {
            session: session.clone(),
            path,
            context: context.clone(),
        })
        .add_step(GetMetaFileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(SelectVersionStep {
            selector: selector.clone(),
            context: context.clone(),
        })
        .add_step(DownloadVersionStep {
            session,
            selector,
            context: context.clone(),
        });

    WithResult::new(process, move || context.lock().destination.clone())
}

struct FindIndexStep {
    session: Arc<Session>,
    path: PathBuf,
    context: Arc<Mutex<RecoverContext>>,
}

impl ProcessStep for FindIndexStep {
    fn name(&self) -> &str {
        "find index"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let relative = relative_to_root(self.session.root(), &self.path)
            .map_err(|e| StepError::with_source("invalid path", e))?;

        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let profile = manager
            .get_user_profile(pid, false)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;
        let node_id = profile.tree().find_by_path(&relative).ok_or_else(|| {
            StepError::new(format!("'{}' is not in the network", relative.display()))
        })?;
        let node = profile
            .tree()
            .node(node_id)
            .ok_or_else(|| StepError::new("index node disappeared"))?;
        if !node.is_file() {
            return Err(StepError::new("only files have versions to recover"));
        }

        let mut ctx = self.context.lock();
        ctx.relative = relative;
        ctx.node_keys = Some(node.keys.clone());
        Ok(())
    }
}

struct GetMetaFileStep {
    session: Arc<Session>,
    context: Arc<Mutex<RecoverContext>>,
}

impl ProcessStep for GetMetaFileStep {
    fn name(&self) -> &str {
        "get meta file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let node_keys = self
            .context
            .lock()
            .node_keys
            .clone()
            .ok_or_else(|| StepError::new("node keys missing"))?;
        let meta_file = fetch_meta_file(self.session.data_manager(), &node_keys)
            .map_err(|e| StepError::with_source("cannot fetch meta file", e))?;
        self.context.lock().meta_file = Some(meta_file);
        Ok(())
    }
}

struct SelectVersionStep {
    selector: Arc<dyn VersionSelector>,
    context: Arc<Mutex<RecoverContext>>,
}

impl ProcessStep for SelectVersionStep {
    fn name(&self) -> &str {
        "select version"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let mut ctx = self.context.lock();
        let meta_file = ctx
            .meta_file
            .as_ref()
            .ok_or_else(|| StepError::new("meta file missing"))?;
        let selected = self
            .selector
            .select(meta_file.versions())
            .ok_or_else(|| StepError::new("version selection aborted"))?;
        if meta_file.version_by_index(selected).is_none() {
            return Err(StepError::new(format!("no version with index {selected}")));
        }
        ctx.selected = Some(selected);
        Ok(())
    }
}

struct DownloadVersionStep {
    session: Arc<Session>,
    selector: Arc<dyn VersionSelector>,
    context: Arc<Mutex<RecoverContext>>,
}

impl ProcessStep for DownloadVersionStep {
    fn name(&self) -> &str {
        "download version"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (relative, meta_file, selected) = {
            let ctx = self.context.lock();
            (
                ctx.relative.clone(),
                ctx.meta_file
                    .clone()
                    .ok_or_else(|| StepError::new("meta file missing"))?,
                ctx.selected
                    .ok_or_else(|| StepError::new("no version selected"))?,
            )
        };
        let version = meta_file
            .version_by_index(selected)
            .ok_or_else(|| StepError::new("selected version disappeared"))?
            .clone();

        let original_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StepError::new("path has no file name"))?;
        let recovered_name = self.selector.recovered_name(&original_name, selected);
        let destination = self
            .session
            .root()
            .join(&relative)
            .with_file_name(recovered_name);

        download_version(
            self.session.data_manager(),
            &meta_file,
            &version,
            &destination,
        )
        .map_err(|e| StepError::with_source("version download failed", e))?;

        info!(
            file = %relative.display(),
            version = selected,
            recovered = %destination.display(),
            "version recovered"
        );
        self.context.lock().destination = Some(destination);
        Ok(())
    }
}
