//! Role-scoped visibility.
//!
//! A [`VisibilityScope`] is derived per request from the caller and the
//! current organizational directory. Every record family is filtered through
//! the same scope; families differ only in which field names the owner.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{AgentId, TrackerError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    TeamLeader,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::TeamLeader => "team_leader",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "team_leader" => Some(Self::TeamLeader),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Parses a stored role, degrading anything unrecognized to [`Role::User`].
    /// The second element is `true` when the fallback was taken.
    #[must_use]
    pub fn parse_or_restrictive(value: &str) -> (Self, bool) {
        match Self::parse(value.trim()) {
            Some(role) => (role, false),
            None => (Self::User, true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentIdentity {
    pub agent_id: AgentId,
    pub username: String,
}

/// The identity a read is performed on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caller {
    pub agent_id: AgentId,
    pub username: String,
    pub role: Role,
    pub supervisor_id: Option<AgentId>,
}

impl Caller {
    #[must_use]
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            agent_id: self.agent_id,
            username: self.username.clone(),
        }
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    /// # Errors
    /// Returns [`TrackerError::Forbidden`] when the caller does not hold `role`.
    pub fn require_role(&self, role: Role) -> Result<(), TrackerError> {
        if self.role == role {
            return Ok(());
        }

        Err(TrackerError::Forbidden(format!(
            "`{}` requires role {}, caller has {}",
            self.username,
            role.as_str(),
            self.role.as_str()
        )))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordFamily {
    Leads,
    MisRecords,
    LoginLogs,
    MisUploads,
    Agents,
}

impl RecordFamily {
    pub const ALL: [Self; 5] = [
        Self::Leads,
        Self::MisRecords,
        Self::LoginLogs,
        Self::MisUploads,
        Self::Agents,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leads => "leads",
            Self::MisRecords => "mis_records",
            Self::LoginLogs => "login_logs",
            Self::MisUploads => "mis_uploads",
            Self::Agents => "agents",
        }
    }

    /// How records of this family name their owner.
    #[must_use]
    pub fn ownership(self) -> OwnershipKind {
        match self {
            Self::MisRecords => OwnershipKind::AgentTag,
            Self::Leads | Self::LoginLogs | Self::MisUploads | Self::Agents => {
                OwnershipKind::AgentId
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipKind {
    /// Owner stored as an agent id (creator, login subject, uploader).
    AgentId,
    /// Owner stored as a soft username tag derived from a campaign-id.
    AgentTag,
}

/// The owner of one record as seen by the scope check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerRef<'a> {
    Agent(AgentId),
    Tag(Option<&'a str>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "members", rename_all = "snake_case")]
pub enum VisibilityScope {
    Unrestricted,
    Members(BTreeSet<AgentIdentity>),
}

impl VisibilityScope {
    /// Builds the scope for `caller` from an already-resolved list of the
    /// agents it supervises. Reports are ignored for anyone but a team leader.
    #[must_use]
    pub fn for_caller(caller: &Caller, direct_reports: &[AgentIdentity]) -> Self {
        match caller.role {
            Role::Admin => Self::Unrestricted,
            Role::TeamLeader => {
                let mut members: BTreeSet<AgentIdentity> =
                    direct_reports.iter().cloned().collect();
                members.insert(caller.identity());
                Self::Members(members)
            }
            Role::User => Self::Members(BTreeSet::from([caller.identity()])),
        }
    }

    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Unrestricted)
    }

    /// Whether a record owned by `owner` is visible. Tags compare against
    /// member usernames ignoring ASCII case; an untagged record is visible
    /// only to an unrestricted scope.
    #[must_use]
    pub fn admits(&self, owner: OwnerRef<'_>) -> bool {
        let Self::Members(members) = self else {
            return true;
        };

        match owner {
            OwnerRef::Agent(agent_id) => members.iter().any(|member| member.agent_id == agent_id),
            OwnerRef::Tag(Some(tag)) => members
                .iter()
                .any(|member| member.username.eq_ignore_ascii_case(tag.trim())),
            OwnerRef::Tag(None) => false,
        }
    }

    /// Member ids, or `None` when unrestricted.
    #[must_use]
    pub fn member_ids(&self) -> Option<Vec<AgentId>> {
        match self {
            Self::Unrestricted => None,
            Self::Members(members) => Some(members.iter().map(|member| member.agent_id).collect()),
        }
    }

    /// Member usernames uppercased for tag matching, or `None` when
    /// unrestricted.
    #[must_use]
    pub fn member_tags(&self) -> Option<Vec<String>> {
        match self {
            Self::Unrestricted => None,
            Self::Members(members) => Some(
                members
                    .iter()
                    .map(|member| member.username.to_ascii_uppercase())
                    .collect(),
            ),
        }
    }
}

/// Read access to the current organizational hierarchy.
pub trait OrgDirectory {
    type Error;

    /// # Errors
    /// Implementation-defined lookup failure.
    fn supervisor_of(&self, agent_id: AgentId) -> Result<Option<AgentId>, Self::Error>;

    /// Agents currently supervised by `supervisor_id`.
    ///
    /// # Errors
    /// Implementation-defined lookup failure.
    fn direct_reports(&self, supervisor_id: AgentId) -> Result<Vec<AgentIdentity>, Self::Error>;
}

/// Resolves the caller's scope against the directory's current state. Team
/// membership is looked up on every call.
///
/// # Errors
/// Propagates directory lookup failures.
pub fn resolve_scope<D: OrgDirectory + ?Sized>(
    caller: &Caller,
    directory: &D,
) -> Result<VisibilityScope, D::Error> {
    let reports = match caller.role {
        Role::TeamLeader => directory.direct_reports(caller.agent_id)?,
        Role::User | Role::Admin => Vec::new(),
    };
    Ok(VisibilityScope::for_caller(caller, &reports))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;

    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err:?}"),
        }
    }

    fn identity(id: i64, username: &str) -> AgentIdentity {
        AgentIdentity {
            agent_id: AgentId(id),
            username: username.to_string(),
        }
    }

    fn caller(id: i64, username: &str, role: Role) -> Caller {
        Caller {
            agent_id: AgentId(id),
            username: username.to_string(),
            role,
            supervisor_id: None,
        }
    }

    #[derive(Default)]
    struct FixtureDirectory {
        supervisors: BTreeMap<i64, i64>,
        usernames: BTreeMap<i64, String>,
        lookups: Cell<u32>,
    }

    impl FixtureDirectory {
        fn with_agent(mut self, id: i64, username: &str, supervisor: Option<i64>) -> Self {
            self.usernames.insert(id, username.to_string());
            if let Some(supervisor) = supervisor {
                self.supervisors.insert(id, supervisor);
            }
            self
        }
    }

    impl OrgDirectory for FixtureDirectory {
        type Error = String;

        fn supervisor_of(&self, agent_id: AgentId) -> Result<Option<AgentId>, Self::Error> {
            Ok(self.supervisors.get(&agent_id.0).copied().map(AgentId))
        }

        fn direct_reports(&self, supervisor_id: AgentId) -> Result<Vec<AgentIdentity>, Self::Error> {
            self.lookups.set(self.lookups.get() + 1);
            Ok(self
                .supervisors
                .iter()
                .filter(|(_, supervisor)| **supervisor == supervisor_id.0)
                .filter_map(|(id, _)| self.usernames.get(id).map(|name| identity(*id, name)))
                .collect())
        }
    }

    fn team_directory() -> FixtureDirectory {
        FixtureDirectory::default()
            .with_agent(10, "tl010", None)
            .with_agent(1, "rpm001", Some(10))
            .with_agent(2, "rpm002", Some(10))
            .with_agent(3, "rpm003", Some(20))
    }

    #[test]
    fn admin_admits_every_record() {
        let scope = VisibilityScope::for_caller(&caller(99, "admin", Role::Admin), &[]);
        assert!(scope.is_unrestricted());
        assert!(scope.admits(OwnerRef::Agent(AgentId(12345))));
        assert!(scope.admits(OwnerRef::Tag(Some("ANYONE1"))));
        assert!(scope.admits(OwnerRef::Tag(None)));
        assert_eq!(scope.member_ids(), None);
    }

    #[test]
    fn user_admits_only_self() {
        let reports = [identity(2, "rpm002")];
        let scope = VisibilityScope::for_caller(&caller(1, "rpm001", Role::User), &reports);

        assert!(scope.admits(OwnerRef::Agent(AgentId(1))));
        assert!(scope.admits(OwnerRef::Tag(Some("RPM001"))));
        assert!(!scope.admits(OwnerRef::Agent(AgentId(2))));
        assert!(!scope.admits(OwnerRef::Tag(Some("RPM002"))));
        assert!(!scope.admits(OwnerRef::Tag(None)));
    }

    #[test]
    fn team_leader_admits_reports_and_self_only() {
        let directory = team_directory();
        let leader = caller(10, "tl010", Role::TeamLeader);
        let scope = must_ok(resolve_scope(&leader, &directory));

        for owner in [1, 2, 10] {
            assert!(scope.admits(OwnerRef::Agent(AgentId(owner))), "{owner}");
        }
        assert!(!scope.admits(OwnerRef::Agent(AgentId(3))));
        assert!(scope.admits(OwnerRef::Tag(Some("rpm002"))));
        assert!(!scope.admits(OwnerRef::Tag(Some("RPM003"))));
        assert_eq!(
            scope.member_tags(),
            Some(vec![
                "RPM001".to_string(),
                "RPM002".to_string(),
                "TL010".to_string()
            ])
        );
    }

    #[test]
    fn membership_is_looked_up_on_every_resolution() {
        let mut directory = team_directory();
        let leader = caller(10, "tl010", Role::TeamLeader);

        let before = must_ok(resolve_scope(&leader, &directory));
        assert!(!before.admits(OwnerRef::Agent(AgentId(3))));

        directory.supervisors.insert(3, 10);
        let after = must_ok(resolve_scope(&leader, &directory));
        assert!(after.admits(OwnerRef::Agent(AgentId(3))));
        assert_eq!(directory.lookups.get(), 2);
        assert_eq!(must_ok(directory.supervisor_of(AgentId(3))), Some(AgentId(10)));
    }

    #[test]
    fn users_and_admins_never_consult_the_directory() {
        let directory = team_directory();
        must_ok(resolve_scope(&caller(1, "rpm001", Role::User), &directory));
        must_ok(resolve_scope(&caller(99, "admin", Role::Admin), &directory));
        assert_eq!(directory.lookups.get(), 0);
    }

    #[test]
    fn unknown_roles_fall_back_to_self_only() {
        let (role, fell_back) = Role::parse_or_restrictive("superuser");
        assert_eq!(role, Role::User);
        assert!(fell_back);

        let (role, fell_back) = Role::parse_or_restrictive("team_leader");
        assert_eq!(role, Role::TeamLeader);
        assert!(!fell_back);

        let scope = VisibilityScope::for_caller(&caller(5, "odd5", role_of("superuser")), &[]);
        assert!(!scope.is_unrestricted());
        assert_eq!(scope.member_ids(), Some(vec![AgentId(5)]));
    }

    fn role_of(raw: &str) -> Role {
        Role::parse_or_restrictive(raw).0
    }

    #[test]
    fn require_role_reports_forbidden() {
        let user = caller(1, "rpm001", Role::User);
        assert!(matches!(
            user.require_role(Role::Admin),
            Err(TrackerError::Forbidden(_))
        ));
        must_ok(caller(9, "admin", Role::Admin).require_role(Role::Admin));
    }

    #[test]
    fn families_map_to_their_ownership_field() {
        assert_eq!(RecordFamily::MisRecords.ownership(), OwnershipKind::AgentTag);
        for family in [RecordFamily::Leads, RecordFamily::LoginLogs, RecordFamily::Agents] {
            assert_eq!(family.ownership(), OwnershipKind::AgentId);
        }
    }

    fn arb_role() -> impl Strategy<Value = Role> {
        prop_oneof![Just(Role::User), Just(Role::TeamLeader), Just(Role::Admin)]
    }

    proptest! {
        #[test]
        fn same_owner_gets_same_decision_across_families(
            role in arb_role(),
            reports in proptest::collection::btree_set(1_i64..40, 0..6),
            owner in 1_i64..50,
        ) {
            let directory = reports.iter().fold(
                FixtureDirectory::default().with_agent(100, "lead100", None),
                |directory, id| directory.with_agent(*id, &format!("agent{id:03}"), Some(100)),
            );
            let scope = must_ok(resolve_scope(&caller(100, "lead100", role), &directory));
            let owner_name = format!("AGENT{owner:03}");

            let by_id = scope.admits(OwnerRef::Agent(AgentId(owner)));
            let by_tag = scope.admits(OwnerRef::Tag(Some(&owner_name)));
            prop_assert_eq!(by_id, by_tag);

            let expected = match role {
                Role::Admin => true,
                Role::TeamLeader => reports.contains(&owner),
                Role::User => false,
            };
            prop_assert_eq!(by_id, expected);
        }
    }
}
