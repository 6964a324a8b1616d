//! Permission Oracle (spec §4.8): the four-level `read < write < operate <
//! admin` lattice, plus project-scoped visibility checks. Deriving
//! `PartialOrd` off field order gives the lattice's total order directly,
//! the same trick the teacher's `core::security::Permission` enum uses.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
    Operate,
    Admin,
}

impl Role {
    pub fn parse(value: &str) -> Option<Role> {
        match value.to_ascii_lowercase().as_str() {
            "read" | "viewer" => Some(Role::Read),
            "write" | "editor" => Some(Role::Write),
            "operate" | "operator" => Some(Role::Operate),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }
}

/// A subject's access to a specific project. Projects are opaque string
/// identifiers owned by the caller; the oracle only tracks membership,
/// never project metadata. `required` is the permission level the caller
/// needs on the project; the directory resolves the subject's max team
/// grant on `project_id` and compares it against `required` itself, so the
/// lattice comparison lives in one place regardless of backend.
pub trait AccessDirectory: Send + Sync {
    fn has_project_access(&self, subject: &str, project_id: &str, required: Role) -> bool;
    fn visible_agents(&self, subject: &str, all_agent_ids: &[String]) -> Vec<String>;
}

/// Default directory: superadmins and admins see everything; everyone else
/// sees nothing unless an external directory says otherwise. Suitable when
/// no project-scoping backend is wired in.
pub struct AllowAdminsOnly;

impl AccessDirectory for AllowAdminsOnly {
    fn has_project_access(&self, _subject: &str, _project_id: &str, _required: Role) -> bool {
        false
    }

    fn visible_agents(&self, _subject: &str, _all_agent_ids: &[String]) -> Vec<String> {
        Vec::new()
    }
}

pub struct PermissionOracle {
    directory: Box<dyn AccessDirectory>,
}

impl PermissionOracle {
    pub fn new(directory: Box<dyn AccessDirectory>) -> Self {
        Self { directory }
    }

    /// `true` if `role` is at least `required` on the lattice, or the
    /// subject is a superadmin (which short-circuits every other check).
    pub fn authorize(&self, role: Role, is_superadmin: bool, required: Role) -> bool {
        is_superadmin || role.satisfies(required)
    }

    /// `true` if the subject's max team grant on `project_id` meets or
    /// exceeds `required` on the lattice, or the subject is a superadmin.
    pub fn has_project_access(
        &self,
        subject: &str,
        is_superadmin: bool,
        project_id: &str,
        required: Role,
    ) -> bool {
        is_superadmin || self.directory.has_project_access(subject, project_id, required)
    }

    /// Filter `all_agent_ids` down to the ones `subject` may see. Superadmins
    /// and admins see every agent; other roles defer to the directory.
    pub fn visible_agents(
        &self,
        subject: &str,
        role: Role,
        is_superadmin: bool,
        all_agent_ids: &[String],
    ) -> Vec<String> {
        if is_superadmin || role >= Role::Admin {
            return all_agent_ids.to_vec();
        }
        self.directory.visible_agents(subject, all_agent_ids)
    }

    /// Intersect `candidates` with a previously computed visible set.
    /// Superadmins get `candidates` back unchanged; an empty visible set
    /// always yields an empty result.
    pub fn filter(
        &self,
        is_superadmin: bool,
        visible_set: &[String],
        candidates: &[String],
    ) -> Vec<String> {
        if is_superadmin {
            return candidates.to_vec();
        }
        if visible_set.is_empty() {
            return Vec::new();
        }
        candidates
            .iter()
            .filter(|candidate| visible_set.contains(candidate))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Grants a single fixed max-role-per-project, for exercising the
    /// lattice comparison the real directory is expected to perform.
    struct FixedGrantDirectory {
        max_grant: Role,
    }

    impl AccessDirectory for FixedGrantDirectory {
        fn has_project_access(&self, _subject: &str, _project_id: &str, required: Role) -> bool {
            self.max_grant >= required
        }

        fn visible_agents(&self, _subject: &str, _all_agent_ids: &[String]) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn lattice_order_holds() {
        assert!(Role::Admin > Role::Operate);
        assert!(Role::Operate > Role::Write);
        assert!(Role::Write > Role::Read);
    }

    #[test]
    fn satisfies_is_reflexive_and_monotonic() {
        assert!(Role::Write.satisfies(Role::Write));
        assert!(Role::Operate.satisfies(Role::Write));
        assert!(!Role::Read.satisfies(Role::Write));
    }

    #[test]
    fn superadmin_short_circuits_authorize() {
        let oracle = PermissionOracle::new(Box::new(AllowAdminsOnly));
        assert!(oracle.authorize(Role::Read, true, Role::Admin));
        assert!(!oracle.authorize(Role::Read, false, Role::Admin));
    }

    #[test]
    fn admins_see_all_agents_without_directory_lookup() {
        let oracle = PermissionOracle::new(Box::new(AllowAdminsOnly));
        let all = vec!["a1".to_string(), "a2".to_string()];
        assert_eq!(oracle.visible_agents("u1", Role::Admin, false, &all), all);
    }

    #[test]
    fn parse_accepts_known_aliases_and_rejects_unknown() {
        assert_eq!(Role::parse("operator"), Some(Role::Operate));
        assert_eq!(Role::parse("ADMIN"), Some(Role::Admin));
        assert_eq!(Role::parse("superuser"), None);
    }

    #[test]
    fn filter_intersects_unless_superadmin_or_empty_visible_set() {
        let oracle = PermissionOracle::new(Box::new(AllowAdminsOnly));
        let candidates = vec!["a1".to_string(), "a2".to_string()];
        assert_eq!(oracle.filter(true, &[], &candidates), candidates);
        assert_eq!(oracle.filter(false, &[], &candidates), Vec::<String>::new());
        let visible = vec!["a2".to_string()];
        assert_eq!(oracle.filter(false, &visible, &candidates), vec!["a2".to_string()]);
    }

    #[test]
    fn permission_monotonicity_holds_across_the_lattice() {
        for (high, low) in [
            (Role::Admin, Role::Operate),
            (Role::Operate, Role::Write),
            (Role::Write, Role::Read),
        ] {
            assert!(high.satisfies(low));
        }
    }

    #[test]
    fn project_access_compares_max_grant_against_required() {
        let oracle = PermissionOracle::new(Box::new(FixedGrantDirectory {
            max_grant: Role::Write,
        }));
        assert!(oracle.has_project_access("u1", false, "proj-1", Role::Read));
        assert!(oracle.has_project_access("u1", false, "proj-1", Role::Write));
        assert!(!oracle.has_project_access("u1", false, "proj-1", Role::Operate));
        assert!(!oracle.has_project_access("u1", false, "proj-1", Role::Admin));
    }

    #[test]
    fn project_access_monotonicity_holds_as_required_rises() {
        let oracle = PermissionOracle::new(Box::new(FixedGrantDirectory {
            max_grant: Role::Operate,
        }));
        let granted: Vec<Role> = [Role::Read, Role::Write, Role::Operate, Role::Admin]
            .into_iter()
            .filter(|required| oracle.has_project_access("u1", false, "proj-1", *required))
            .collect();
        assert_eq!(granted, vec![Role::Read, Role::Write, Role::Operate]);
    }

    #[test]
    fn project_access_superadmin_short_circuits_directory() {
        let oracle = PermissionOracle::new(Box::new(AllowAdminsOnly));
        assert!(oracle.has_project_access("u1", true, "proj-1", Role::Admin));
    }
}
