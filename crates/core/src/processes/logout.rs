//! Closing a session: persist the sidecar and leave the locations.

use crate::file::disk::digest_tree;
use crate::file::sidecar::{write_sidecar, PersistentMetadata};
use crate::notify::{fetch_locations, store_locations};
use crate::session::Session;
use meshvault_process::{
    CancelToken, ProcessStep, RollbackReason, SequentialProcess, StepError,
};
use std::sync::Arc;
use tracing::warn;

/// Build the logout pipeline. The caller stops the profile queue worker
/// after the process finished.
pub fn logout_process(session: Arc<Session>) -> SequentialProcess {
    let mut process = SequentialProcess::new("logout");
    process
        .add_step(WriteSidecarStep {
            session: session.clone(),
        })
        .add_step(RemoveFromLocationsStep { session });
    process
}

struct WriteSidecarStep {
    session: Arc<Session>,
}

impl ProcessStep for WriteSidecarStep {
    fn name(&self) -> &str {
        "write sidecar"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let file_tree = digest_tree(self.session.root())
            .map_err(|e| StepError::with_source("cannot digest local files", e))?;
        let metadata = PersistentMetadata {
            file_tree,
            public_key_cache: self.session.key_cache().snapshot(),
        };
        write_sidecar(self.session.root(), &metadata)
            .map_err(|e| StepError::with_source("cannot write sidecar", e))
    }
}

struct RemoveFromLocationsStep {
    session: Arc<Session>,
}

impl ProcessStep for RemoveFromLocationsStep {
    fn name(&self) -> &str {
        "remove from locations"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let data_manager = self.session.data_manager();
        let Some(mut locations) = fetch_locations(data_manager, self.session.user_id())
            .map_err(|e| StepError::with_source("cannot fetch locations", e))?
        else {
            return Ok(());
        };

        locations.remove_peer(self.session.address());

        let protection = self
            .session
            .profile_manager()
            .protection_keys()
            .map_err(|e| StepError::with_source("cannot load protection keys", e))?;
        store_locations(
            data_manager,
            &locations,
            &protection,
            self.session.ttl().locations,
        )
        .map_err(|e| StepError::with_source("cannot store locations", e))
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        // Logout compensation re-registers this peer.
        let data_manager = self.session.data_manager();
        let result = fetch_locations(data_manager, self.session.user_id()).and_then(
            |locations| match locations {
                Some(mut locations) => {
                    locations.add_peer(
                        self.session.address().clone(),
                        crate::model::now_millis(),
                    );
                    let protection = self.session.profile_manager().protection_keys()?;
                    store_locations(
                        data_manager,
                        &locations,
                        &protection,
                        self.session.ttl().locations,
                    )
                }
                None => Ok(()),
            },
        );
        if let Err(e) = result {
            warn!(error = %e, "could not re-register peer during rollback");
        }
    }
}
