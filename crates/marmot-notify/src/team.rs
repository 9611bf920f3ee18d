use async_trait::async_trait;
use marmot_domain::{MarmotError, TeamId, UserId};

/// Capability trait injected into the aggregator so it never depends on a
/// concrete identity/team service — the same seam-via-trait-object pattern
/// `marmot-membership` uses for `MembershipObserver`.
#[async_trait]
pub trait TeamMembershipProvider: Send + Sync + 'static {
    async fn members_of(&self, team: &TeamId) -> Result<Vec<UserId>, MarmotError>;
}

/// Trivial provider for tests and single-user deployments: every team
/// resolves to no members, so team-addressed notifications are dropped
/// rather than mis-delivered.
pub struct NoTeamsProvider;

#[async_trait]
impl TeamMembershipProvider for NoTeamsProvider {
    async fn members_of(&self, _team: &TeamId) -> Result<Vec<UserId>, MarmotError> {
        Ok(Vec::new())
    }
}
