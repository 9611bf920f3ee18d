//! Wiring-only glue: adapts `marmot-notify`'s `NotifyHandle` to the
//! capability traits `marmot-membership` and `marmot-scheduler` expect an
//! observer to implement, so neither of those crates has to know
//! notifications exist (Design Notes §9).

use std::sync::Arc;

use async_trait::async_trait;
use marmot_domain::{AssetId, PipelineRun, Recipient, RuleId, RunStatus, UserId};
use marmot_membership::MembershipObserver;
use marmot_notify::{CreateInput, NotifyHandle, QueueChangeInput};
use marmot_scheduler::RunObserver;
use marmot_store::{AssetRepository, RuleRepository};
use tracing::warn;

pub struct NotifyMembershipObserver {
    pub notify: NotifyHandle,
    pub rules: Arc<dyn RuleRepository>,
    pub assets: Arc<dyn AssetRepository>,
}

#[async_trait]
impl MembershipObserver for NotifyMembershipObserver {
    async fn rule_assets_changed(&self, rule_id: RuleId, added: Vec<AssetId>, removed: Vec<AssetId>) {
        let rule = match self.rules.get(rule_id).await {
            Ok(Some(rule)) => rule,
            Ok(None) => return,
            Err(e) => {
                warn!(%rule_id, error = %e, "could not load rule for membership notification");
                return;
            }
        };
        let recipient = Recipient::User(UserId(rule.owner_entity_id.clone()));

        for asset_id in added.into_iter().chain(removed.into_iter()) {
            let asset = match self.assets.get(asset_id).await {
                Ok(Some(asset)) => asset,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%asset_id, error = %e, "could not load asset for membership notification");
                    continue;
                }
            };
            self.notify
                .queue_change(QueueChangeInput {
                    kind: marmot_domain::NotificationKind::AssetChange,
                    asset_id: asset.id,
                    mrn: asset.mrn,
                    name: asset.name,
                    recipients: vec![recipient.clone()],
                })
                .await;
        }
    }
}

pub struct NotifyRunObserver {
    pub notify: NotifyHandle,
}

#[async_trait]
impl RunObserver for NotifyRunObserver {
    async fn run_completed(&self, run: &PipelineRun) {
        let title = match run.status {
            RunStatus::Completed => format!("{} completed", run.pipeline_name),
            RunStatus::Failed => format!("{} failed", run.pipeline_name),
            RunStatus::Cancelled => format!("{} cancelled", run.pipeline_name),
            RunStatus::Pending | RunStatus::Running => return,
        };
        let message = run.error_message.clone().unwrap_or_else(|| "no details".to_string());
        let mut data = std::collections::HashMap::new();
        data.insert("run_id".to_string(), serde_json::json!(run.id));
        data.insert("status".to_string(), serde_json::json!(run.status));

        if let Err(e) = self
            .notify
            .create(CreateInput {
                recipient: Recipient::User(UserId(run.created_by.clone())),
                kind: marmot_domain::NotificationKind::JobCompletion,
                title,
                message,
                data,
                link: None,
            })
            .await
        {
            warn!(run_id = %run.id, error = %e, "could not deliver job completion notification");
        }
    }
}
