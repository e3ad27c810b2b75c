use once_cell::sync::OnceCell;
use skilldeck_core::{Category, Credentials, Skill, SkillError, SkillId, SkillKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::command::CommandSkill;
use crate::definition::{SkillDescriptor, peek_header};

struct SkillEntry {
    descriptor: Arc<SkillDescriptor>,
    implementation: Option<Arc<dyn Skill>>,
}

/// A shared library known by id and path until something needs it.
struct LibraryEntry {
    path: Option<PathBuf>,
    category: Category,
    descriptor: OnceCell<Arc<SkillDescriptor>>,
}

/// The skill registry: discovers SKILL.md descriptors and owns them.
///
/// Skills come from two namespaces. User directories are scanned before
/// system directories, so on an id clash the user skill is kept. Shared
/// libraries are only indexed during discovery; they are parsed and
/// checked the first time a dependent skill is dispatched.
///
/// The registry is written during startup and read-only afterwards.
pub struct SkillRegistry {
    skills: Vec<SkillEntry>,
    index: HashMap<SkillId, usize>,
    libraries: HashMap<SkillId, LibraryEntry>,
    dirs: Vec<(PathBuf, Category)>,
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillRegistry {
    /// Create an empty registry (programmatic registration only).
    pub fn new() -> Self {
        Self {
            skills: Vec::new(),
            index: HashMap::new(),
            libraries: HashMap::new(),
            dirs: Vec::new(),
        }
    }

    /// Create a registry over system and user skill directories.
    pub fn with_dirs(system_dirs: &[PathBuf], user_dirs: &[PathBuf]) -> Self {
        let dirs = user_dirs
            .iter()
            .map(|d| (d.clone(), Category::User))
            .chain(system_dirs.iter().map(|d| (d.clone(), Category::System)))
            .collect();
        Self {
            dirs,
            ..Self::new()
        }
    }

    /// Discover and load all SKILL.md descriptors from the configured
    /// directories. Returns the ids loaded (libraries included, unparsed).
    pub fn discover(&mut self) -> skilldeck_core::Result<Vec<SkillId>> {
        let mut loaded = Vec::new();

        for (dir, category) in self.dirs.clone() {
            if !dir.exists() {
                debug!(?dir, "skills directory does not exist, skipping");
                continue;
            }

            for skill_md in skill_files(&dir)? {
                let (id, kind) = match peek_header(&skill_md) {
                    Ok(header) => header,
                    Err(e) => {
                        warn!(path = ?skill_md, error = %e, "failed to load skill");
                        continue;
                    }
                };

                if self.contains(&id) {
                    warn!(
                        skill = %id,
                        path = ?skill_md,
                        "skill id already loaded from a higher-priority directory, skipping"
                    );
                    continue;
                }

                if kind == SkillKind::SharedLibrary {
                    debug!(skill = %id, path = ?skill_md, "indexed shared library");
                    self.libraries.insert(
                        id.clone(),
                        LibraryEntry {
                            path: Some(skill_md),
                            category,
                            descriptor: OnceCell::new(),
                        },
                    );
                    loaded.push(id);
                    continue;
                }

                match SkillDescriptor::from_file(&skill_md, category) {
                    Ok(def) => {
                        info!(skill = %def.id, %category, path = ?skill_md, "loaded skill");
                        loaded.push(def.id.clone());
                        self.insert(def, None);
                    }
                    Err(e) => {
                        warn!(path = ?skill_md, error = %e, "failed to load skill");
                    }
                }
            }
        }

        Ok(loaded)
    }

    /// Register a descriptor. Its implementation is derived from `command`
    /// when present.
    pub fn register(&mut self, descriptor: SkillDescriptor) -> skilldeck_core::Result<()> {
        self.check_new(&descriptor.id)?;
        self.insert(descriptor, None);
        Ok(())
    }

    /// Register a descriptor with an explicit implementation.
    pub fn register_with(
        &mut self,
        descriptor: SkillDescriptor,
        implementation: Arc<dyn Skill>,
    ) -> skilldeck_core::Result<()> {
        self.check_new(&descriptor.id)?;
        self.insert(descriptor, Some(implementation));
        Ok(())
    }

    fn check_new(&self, id: &str) -> skilldeck_core::Result<()> {
        if self.contains(id) {
            return Err(SkillError::DuplicateSkill(id.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, descriptor: SkillDescriptor, implementation: Option<Arc<dyn Skill>>) {
        if descriptor.kind == SkillKind::SharedLibrary {
            self.libraries.insert(
                descriptor.id.clone(),
                LibraryEntry {
                    path: None,
                    category: descriptor.category,
                    descriptor: OnceCell::with_value(Arc::new(descriptor)),
                },
            );
            return;
        }

        let implementation = implementation.or_else(|| {
            CommandSkill::from_descriptor(&descriptor).map(|c| Arc::new(c) as Arc<dyn Skill>)
        });
        self.index.insert(descriptor.id.clone(), self.skills.len());
        self.skills.push(SkillEntry {
            descriptor: Arc::new(descriptor),
            implementation,
        });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id) || self.libraries.contains_key(id)
    }

    /// Look up a descriptor by id. A shared library is parsed on first
    /// lookup but its credentials are not checked.
    pub fn resolve(&self, id: &str) -> skilldeck_core::Result<Arc<SkillDescriptor>> {
        if let Some(&i) = self.index.get(id) {
            return Ok(Arc::clone(&self.skills[i].descriptor));
        }
        match self.libraries.get(id) {
            Some(lib) => self.load_library(id, lib),
            None => Err(SkillError::UnknownSkill(id.to_string())),
        }
    }

    /// The implementation bound to an invocable skill.
    pub fn implementation(&self, id: &str) -> skilldeck_core::Result<Arc<dyn Skill>> {
        let &i = self.index.get(id).ok_or_else(|| {
            if self.libraries.contains_key(id) {
                SkillError::NotInvocable(id.to_string())
            } else {
                SkillError::UnknownSkill(id.to_string())
            }
        })?;
        self.skills[i].implementation.clone().ok_or_else(|| {
            SkillError::Configuration(format!(
                "skill '{id}' has no implementation (declare a `command`)"
            ))
        })
    }

    /// Parse a shared library (once) and verify its credentials are set.
    pub fn materialize_library(
        &self,
        id: &str,
        credentials: &Credentials,
    ) -> skilldeck_core::Result<Arc<SkillDescriptor>> {
        let lib = self.libraries.get(id).ok_or_else(|| {
            if self.index.contains_key(id) {
                SkillError::Validation(format!("'{id}' is not a shared library"))
            } else {
                SkillError::UnknownSkill(id.to_string())
            }
        })?;
        let descriptor = self.load_library(id, lib)?;
        credentials.require_all(&descriptor.requires)?;
        Ok(descriptor)
    }

    fn load_library(&self, id: &str, lib: &LibraryEntry) -> skilldeck_core::Result<Arc<SkillDescriptor>> {
        lib.descriptor
            .get_or_try_init(|| {
                let path = lib
                    .path
                    .as_deref()
                    .ok_or_else(|| SkillError::UnknownSkill(id.to_string()))?;
                let def = SkillDescriptor::from_file(path, lib.category)?;
                if def.kind != SkillKind::SharedLibrary {
                    return Err(SkillError::InvalidSkill {
                        path: path.display().to_string(),
                        reason: "kind changed since discovery".into(),
                    });
                }
                info!(skill = %def.id, "materialized shared library");
                Ok(Arc::new(def))
            })
            .cloned()
    }

    /// Whether a shared library has been parsed yet.
    pub fn is_materialized(&self, id: &str) -> bool {
        self.libraries
            .get(id)
            .is_some_and(|lib| lib.descriptor.get().is_some())
    }

    /// Invocable skills in registration order.
    pub fn list(&self) -> Vec<Arc<SkillDescriptor>> {
        self.skills.iter().map(|e| Arc::clone(&e.descriptor)).collect()
    }

    /// Ids of shared libraries, sorted.
    pub fn libraries(&self) -> Vec<SkillId> {
        let mut ids: Vec<_> = self.libraries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All `(phrase, skill_id, category)` tuples of invocable skills, in
    /// registration order.
    pub fn list_triggers(&self) -> Vec<(String, SkillId, Category)> {
        self.skills
            .iter()
            .flat_map(|e| {
                let d = &e.descriptor;
                d.triggers
                    .iter()
                    .map(move |t| (t.clone(), d.id.clone(), d.category))
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.skills.len() + self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Scaffold `<dir>/<id>/SKILL.md` from the template.
    pub fn create(&self, dir: &Path, id: &str) -> skilldeck_core::Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(SkillError::Validation(format!(
                "skill id '{id}' must be lowercase letters, digits, '-' or '_'"
            )));
        }
        if self.contains(id) {
            return Err(SkillError::DuplicateSkill(id.to_string()));
        }

        let skill_dir = dir.join(id);
        let path = skill_dir.join("SKILL.md");
        if path.exists() {
            return Err(SkillError::DuplicateSkill(id.to_string()));
        }
        std::fs::create_dir_all(&skill_dir)?;
        std::fs::write(&path, SkillDescriptor::template(id))?;
        info!(skill = %id, ?path, "created skill");
        Ok(path)
    }
}

/// SKILL.md files directly under `dir` or one level down, sorted by path so
/// registration order is stable across runs.
fn skill_files(dir: &Path) -> skilldeck_core::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        SkillError::Config(format!("failed to read skills dir {}: {}", dir.display(), e))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            let skill_md = path.join("SKILL.md");
            if skill_md.exists() {
                files.push(skill_md);
            }
        } else if path.file_name().is_some_and(|n| n == "SKILL.md") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir: &str, frontmatter: &str) {
        let d = root.join(dir);
        std::fs::create_dir_all(&d).unwrap();
        std::fs::write(d.join("SKILL.md"), format!("---\n{frontmatter}\n---\n\nBody.")).unwrap();
    }

    #[test]
    fn register_duplicate_fails() {
        let mut reg = SkillRegistry::new();
        reg.register(SkillDescriptor::new("a", Category::System)).unwrap();
        let err = reg
            .register(SkillDescriptor::new("a", Category::User))
            .unwrap_err();
        assert!(matches!(err, SkillError::DuplicateSkill(id) if id == "a"));
    }

    #[test]
    fn resolve_unknown_fails() {
        let reg = SkillRegistry::new();
        assert!(matches!(
            reg.resolve("ghost"),
            Err(SkillError::UnknownSkill(_))
        ));
    }

    #[test]
    fn list_triggers_skips_libraries() {
        let mut reg = SkillRegistry::new();
        reg.register(
            SkillDescriptor::new("standup", Category::User).with_triggers(["post standup"]),
        )
        .unwrap();
        reg.register(
            SkillDescriptor::new("slack-lib", Category::System)
                .with_kind(SkillKind::SharedLibrary)
                .with_triggers(["slack"]),
        )
        .unwrap();

        let triggers = reg.list_triggers();
        assert_eq!(
            triggers,
            vec![("post standup".to_string(), "standup".to_string(), Category::User)]
        );
        assert!(matches!(
            reg.implementation("slack-lib"),
            Err(SkillError::NotInvocable(_))
        ));
    }

    #[test]
    fn discover_user_dir_wins_id_clash() {
        let system = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_skill(system.path(), "dup", "name: dup\ndescription: System version");
        write_skill(user.path(), "dup", "name: dup\ndescription: User version");
        write_skill(system.path(), "other", "name: other\ndescription: Only system");

        let mut reg = SkillRegistry::with_dirs(
            &[system.path().to_path_buf()],
            &[user.path().to_path_buf()],
        );
        let loaded = reg.discover().unwrap();
        assert_eq!(loaded, vec!["dup", "other"]);

        let dup = reg.resolve("dup").unwrap();
        assert_eq!(dup.description, "User version");
        assert_eq!(dup.category, Category::User);
        assert_eq!(reg.resolve("other").unwrap().category, Category::System);
    }

    #[test]
    fn discover_skips_broken_skills() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "good", "name: good\ndescription: Fine");
        write_skill(dir.path(), "bad", "name: bad\ndescription: d\nversion: nope");
        std::fs::create_dir_all(dir.path().join("not-a-skill")).unwrap();

        let mut reg = SkillRegistry::with_dirs(&[dir.path().to_path_buf()], &[]);
        let loaded = reg.discover().unwrap();
        assert_eq!(loaded, vec!["good"]);
    }

    #[test]
    fn libraries_are_lazy() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            dir.path(),
            "beam-auth",
            "name: beam-auth\ndescription: Token helper\nkind: shared-library\nrequires: [BEAM_API_KEY]",
        );

        let mut reg = SkillRegistry::with_dirs(&[dir.path().to_path_buf()], &[]);
        reg.discover().unwrap();
        assert_eq!(reg.libraries(), vec!["beam-auth"]);
        assert!(!reg.is_materialized("beam-auth"));

        let err = reg
            .materialize_library("beam-auth", &Credentials::new())
            .unwrap_err();
        assert_eq!(err.kind(), skilldeck_core::ErrorKind::Configuration);
        // Parsed even though the credential check failed.
        assert!(reg.is_materialized("beam-auth"));

        let mut creds = Credentials::new();
        creds.insert("BEAM_API_KEY", "bk");
        assert!(reg.materialize_library("beam-auth", &creds).is_ok());
    }

    #[test]
    fn nonexistent_dir_is_fine() {
        let mut reg = SkillRegistry::with_dirs(&[PathBuf::from("/nonexistent/skills")], &[]);
        assert!(reg.discover().unwrap().is_empty());
    }

    #[test]
    fn create_scaffolds_skill() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SkillRegistry::new();
        let path = reg.create(dir.path(), "weekly-report").unwrap();
        assert!(path.ends_with("weekly-report/SKILL.md"));
        assert!(reg.create(dir.path(), "weekly-report").is_err());
        assert!(reg.create(dir.path(), "Bad Name").is_err());

        let def = SkillDescriptor::from_file(&path, Category::User).unwrap();
        assert_eq!(def.id, "weekly-report");
    }
}
