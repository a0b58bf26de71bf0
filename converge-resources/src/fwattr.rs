//! Firmware attribute resource, over the kernel-provided tree
//! `<root>/<driver>/attributes/<key>/{current_value,type,...}`.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use converge_core::cmp::{self, CmpMismatch};
use converge_core::context::Context;
use converge_core::error::{Error, Result};
use converge_core::resource::{MetaParams, Resource, Reversible};
use converge_runtime::fswatch::poll_watch;

const KIND: &str = "fwattr";
const DEFAULT_ROOT: &str = "/sys/class/firmware-attributes";

/// Drives one firmware attribute to a desired value.
pub struct FwAttrRes {
    pub name: String,
    pub meta: MetaParams,
    /// The firmware-attributes class root.
    pub root: PathBuf,
    pub driver: String,
    /// Attribute key; defaults to the resource name when empty.
    pub key: String,
    pub value: String,
    /// Refuse alternate-value mapping; the desired value must appear in
    /// `possible_values` verbatim.
    pub strict: bool,
    /// Fallback spellings per desired value, consulted when the desired
    /// enumeration value is not offered verbatim.
    pub alternates: BTreeMap<String, Vec<String>>,

    state: FwState,
}

#[derive(Default)]
struct FwState {
    /// Pre-apply observation used by the reversal capability.
    original: Mutex<Option<String>>,
}

impl Default for FwAttrRes {
    fn default() -> Self {
        Self {
            name: String::new(),
            meta: MetaParams::default(),
            root: PathBuf::from(DEFAULT_ROOT),
            driver: String::new(),
            key: String::new(),
            value: String::new(),
            strict: false,
            alternates: BTreeMap::new(),
            state: FwState::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrType {
    Enumeration,
    Integer,
    Text,
    OrderedList,
}

#[derive(Debug)]
struct AttrInfo {
    attr_type: AttrType,
    possible: Vec<String>,
    min_value: Option<i64>,
    max_value: Option<i64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    scalar_increment: Option<i64>,
}

fn read_opt<T: std::str::FromStr>(dir: &Path, file: &str) -> Option<T> {
    std::fs::read_to_string(dir.join(file))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn read_info(dir: &Path) -> Result<AttrInfo> {
    let raw_type = std::fs::read_to_string(dir.join("type"))
        .map_err(|err| Error::apply(format!("no attribute at {}: {err}", dir.display())))?;
    let attr_type = match raw_type.trim() {
        "enumeration" => AttrType::Enumeration,
        "integer" => AttrType::Integer,
        "string" => AttrType::Text,
        "ordered-list" => AttrType::OrderedList,
        other => {
            return Err(Error::apply(format!(
                "unknown attribute type {other:?} at {}",
                dir.display()
            )))
        }
    };
    let possible = std::fs::read_to_string(dir.join("possible_values"))
        .map(|raw| {
            raw.trim()
                .split(';')
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    Ok(AttrInfo {
        attr_type,
        possible,
        min_value: read_opt(dir, "min_value"),
        max_value: read_opt(dir, "max_value"),
        min_length: read_opt(dir, "min_length"),
        max_length: read_opt(dir, "max_length"),
        scalar_increment: read_opt(dir, "scalar_increment"),
    })
}

fn read_current(dir: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(dir.join("current_value"))
        .map_err(|err| Error::apply(format!("cannot read {}: {err}", dir.display())))?;
    Ok(raw.trim_end_matches('\n').to_owned())
}

impl FwAttrRes {
    fn key(&self) -> &str {
        if self.key.is_empty() {
            &self.name
        } else {
            &self.key
        }
    }

    fn attr_dir(&self) -> PathBuf {
        self.root
            .join(&self.driver)
            .join("attributes")
            .join(self.key())
    }

    /// Maps the desired value onto what the attribute actually offers,
    /// enforcing the per-type constraints.
    fn resolve(&self, info: &AttrInfo) -> Result<String> {
        match info.attr_type {
            AttrType::Enumeration => {
                if info.possible.iter().any(|p| p == &self.value) {
                    return Ok(self.value.clone());
                }
                if !self.strict {
                    if let Some(alternates) = self.alternates.get(&self.value) {
                        if let Some(alt) = alternates
                            .iter()
                            .find(|alt| info.possible.iter().any(|p| &p == alt))
                        {
                            tracing::debug!(
                                wanted = %self.value,
                                using = %alt,
                                "mapped enumeration value through alternates"
                            );
                            return Ok(alt.clone());
                        }
                    }
                }
                Err(Error::validation(format!(
                    "{:?} is not among the possible values {:?}",
                    self.value, info.possible
                )))
            }
            AttrType::Integer => {
                let value: i64 = self.value.parse().map_err(|_| {
                    Error::validation(format!("{:?} is not an integer", self.value))
                })?;
                if let Some(min) = info.min_value {
                    if value < min {
                        return Err(Error::validation(format!("{value} is below min {min}")));
                    }
                }
                if let Some(max) = info.max_value {
                    if value > max {
                        return Err(Error::validation(format!("{value} is above max {max}")));
                    }
                }
                if let Some(step) = info.scalar_increment.filter(|step| *step > 1) {
                    let base = info.min_value.unwrap_or(0);
                    // The kernel interface leaves increment semantics vague;
                    // the accepted heuristic is alignment from the minimum.
                    tracing::warn!(step, "applying scalar_increment alignment heuristic");
                    if (value - base) % step != 0 {
                        return Err(Error::validation(format!(
                            "{value} does not align to increment {step} from {base}"
                        )));
                    }
                }
                Ok(self.value.clone())
            }
            AttrType::Text => {
                if let Some(min) = info.min_length {
                    if self.value.len() < min {
                        return Err(Error::validation(format!(
                            "value is shorter than min_length {min}"
                        )));
                    }
                }
                if let Some(max) = info.max_length {
                    if self.value.len() > max {
                        return Err(Error::validation(format!(
                            "value is longer than max_length {max}"
                        )));
                    }
                }
                Ok(self.value.clone())
            }
            AttrType::OrderedList => {
                for element in self.value.split(';').filter(|e| !e.is_empty()) {
                    if !info.possible.iter().any(|p| p == element) {
                        return Err(Error::validation(format!(
                            "{element:?} is not among the possible values {:?}",
                            info.possible
                        )));
                    }
                }
                Ok(self.value.clone())
            }
        }
    }
}

#[async_trait]
impl Resource for FwAttrRes {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &MetaParams {
        &self.meta
    }

    fn validate(&self) -> Result<()> {
        if self.driver.is_empty() {
            return Err(Error::validation("fwattr requires a driver"));
        }
        if self.value.is_empty() {
            return Err(Error::validation("fwattr requires a value"));
        }
        if self.key().is_empty() {
            return Err(Error::validation("fwattr requires a key"));
        }
        // The attribute tree is safe to probe read-only. In strict mode a
        // value the firmware does not offer verbatim is a static error.
        if self.strict {
            let dir = self.attr_dir();
            if dir.join("type").is_file() {
                let info =
                    read_info(&dir).map_err(|err| Error::validation(err.to_string()))?;
                if info.attr_type == AttrType::Enumeration
                    && !info.possible.iter().any(|p| p == &self.value)
                {
                    return Err(Error::validation(format!(
                        "{:?} is not offered by {} (strict)",
                        self.value,
                        self.attr_dir().display()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn init(&self, _ctx: &Context) -> Result<()> {
        if self.meta.reverse {
            // Pre-apply observation: what to restore on reversal.
            if let Ok(current) = read_current(&self.attr_dir()) {
                *self.state.original.lock() = Some(current);
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, ctx: &Context) -> Result<()> {
        let interval = self.meta.poll.unwrap_or(Duration::from_secs(2));
        let changes = poll_watch(self.attr_dir(), interval, ctx.token().child_token());
        // One event per ready batch; scan failures still surface.
        let mut bursts = Box::pin(changes.ready_chunks(64));

        ctx.running();
        loop {
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                burst = bursts.next() => match burst {
                    Some(batch) => {
                        for change in batch {
                            change?;
                        }
                        if ctx.event().await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    async fn check_apply(&self, ctx: &Context, apply: bool) -> Result<bool> {
        let _ = ctx.refresh();
        let dir = self.attr_dir();
        let info = read_info(&dir)?;
        let current = read_current(&dir)?;
        let desired = self.resolve(&info)?;

        if self.meta.reverse {
            self.state.original.lock().get_or_insert_with(|| current.clone());
        }
        if current == desired {
            return Ok(true);
        }
        if !apply {
            return Ok(false);
        }

        tracing::info!(
            attribute = %dir.display(),
            from = %current,
            to = %desired,
            "writing firmware attribute"
        );
        // The kernel interface wants a trailing newline.
        tokio::fs::write(dir.join("current_value"), format!("{desired}\n")).await?;
        Ok(false)
    }

    fn cmp(&self, other: &dyn Resource) -> Result<(), CmpMismatch> {
        let Some(other) = other.as_any().downcast_ref::<FwAttrRes>() else {
            return Err(CmpMismatch::kind(KIND));
        };
        cmp::field(KIND, "name", &self.name, &other.name)?;
        cmp::field(KIND, "meta", &self.meta, &other.meta)?;
        cmp::field(KIND, "root", &self.root, &other.root)?;
        cmp::field(KIND, "driver", &self.driver, &other.driver)?;
        cmp::field(KIND, "key", &self.key, &other.key)?;
        cmp::field(KIND, "value", &self.value, &other.value)?;
        cmp::field(KIND, "strict", &self.strict, &other.strict)?;
        cmp::field(KIND, "alternates", &self.alternates, &other.alternates)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_reversible(&self) -> Option<&dyn Reversible> {
        Some(self)
    }
}

impl Reversible for FwAttrRes {
    fn reversed(&self) -> Result<Option<Box<dyn Resource>>> {
        if !self.meta.reverse {
            return Ok(None);
        }
        let Some(original) = self.state.original.lock().clone() else {
            return Ok(None);
        };
        Ok(Some(Box::new(FwAttrRes {
            name: self.name.clone(),
            meta: MetaParams {
                reverse: false,
                ..self.meta.clone()
            },
            root: self.root.clone(),
            driver: self.driver.clone(),
            key: self.key.clone(),
            value: original,
            strict: self.strict,
            alternates: self.alternates.clone(),
            state: FwState::default(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    use super::FwAttrRes;
    use converge_core::error::Error;
    use converge_core::resource::{MetaParams, Resource};
    use converge_runtime::runner::Runner;

    fn write_attr(root: &Path, driver: &str, key: &str, fields: &[(&str, &str)]) {
        let dir = root.join(driver).join("attributes").join(key);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, content) in fields {
            std::fs::write(dir.join(file), format!("{content}\n")).unwrap();
        }
    }

    fn boot_order(root: &Path) -> FwAttrRes {
        write_attr(
            root,
            "dell",
            "BootOrder",
            &[
                ("type", "enumeration"),
                ("possible_values", "HDD0;HDD1;USBHDD"),
                ("current_value", "HDD0"),
            ],
        );
        FwAttrRes {
            name: "boot".into(),
            root: root.to_path_buf(),
            driver: "dell".into(),
            key: "BootOrder".into(),
            value: "USB".into(),
            alternates: BTreeMap::from([("USB".to_owned(), vec!["USBHDD".to_owned()])]),
            ..FwAttrRes::default()
        }
    }

    fn current(root: &Path, driver: &str, key: &str) -> String {
        std::fs::read_to_string(root.join(driver).join("attributes").join(key).join("current_value"))
            .unwrap()
    }

    #[tokio::test]
    async fn alternate_mapping_writes_the_offered_spelling() {
        let tree = tempfile::tempdir().unwrap();
        let res = boot_order(tree.path());
        let mut runner = Runner::start(Arc::new(res)).await.unwrap();
        assert!(!runner.converge().await.unwrap());
        assert_eq!(current(tree.path(), "dell", "BootOrder"), "USBHDD\n");
        // Idempotent once the mapped value is in place.
        assert!(runner.converge().await.unwrap());
        runner.shutdown().await.unwrap();
    }

    #[test]
    fn strict_mode_rejects_unoffered_values_statically() {
        let tree = tempfile::tempdir().unwrap();
        let mut res = boot_order(tree.path());
        res.strict = true;
        assert!(matches!(res.validate(), Err(Error::Validation(_))));

        res.value = "USBHDD".into();
        assert!(res.validate().is_ok());
    }

    #[tokio::test]
    async fn integer_attributes_enforce_range_and_increment() {
        let tree = tempfile::tempdir().unwrap();
        write_attr(
            tree.path(),
            "hp",
            "FanSpeed",
            &[
                ("type", "integer"),
                ("current_value", "20"),
                ("min_value", "10"),
                ("max_value", "100"),
                ("scalar_increment", "5"),
            ],
        );
        let make = |value: &str| FwAttrRes {
            name: "fan".into(),
            root: tree.path().to_path_buf(),
            driver: "hp".into(),
            key: "FanSpeed".into(),
            value: value.into(),
            ..FwAttrRes::default()
        };

        let mut runner = Runner::start(Arc::new(make("45"))).await.unwrap();
        assert!(!runner.converge().await.unwrap());
        assert_eq!(current(tree.path(), "hp", "FanSpeed"), "45\n");
        runner.shutdown().await.unwrap();

        for bad in ["5", "200", "43", "zippy"] {
            let mut runner = Runner::start(Arc::new(make(bad))).await.unwrap();
            assert!(
                matches!(runner.converge().await, Err(Error::Validation(_))),
                "{bad} should have been rejected"
            );
            runner.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn string_attributes_enforce_length_bounds() {
        let tree = tempfile::tempdir().unwrap();
        write_attr(
            tree.path(),
            "lenovo",
            "Asset",
            &[
                ("type", "string"),
                ("current_value", "old"),
                ("min_length", "2"),
                ("max_length", "5"),
            ],
        );
        let make = |value: &str| FwAttrRes {
            name: "asset".into(),
            root: tree.path().to_path_buf(),
            driver: "lenovo".into(),
            key: "Asset".into(),
            value: value.into(),
            ..FwAttrRes::default()
        };

        let mut runner = Runner::start(Arc::new(make("ab12"))).await.unwrap();
        assert!(!runner.converge().await.unwrap());
        runner.shutdown().await.unwrap();

        let mut runner = Runner::start(Arc::new(make("toolong"))).await.unwrap();
        assert!(runner.converge().await.is_err());
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ordered_list_elements_must_be_offered() {
        let tree = tempfile::tempdir().unwrap();
        write_attr(
            tree.path(),
            "dell",
            "Sequence",
            &[
                ("type", "ordered-list"),
                ("possible_values", "a;b;c"),
                ("current_value", "a;b"),
            ],
        );
        let make = |value: &str| FwAttrRes {
            name: "seq".into(),
            root: tree.path().to_path_buf(),
            driver: "dell".into(),
            key: "Sequence".into(),
            value: value.into(),
            ..FwAttrRes::default()
        };

        let mut runner = Runner::start(Arc::new(make("c;a"))).await.unwrap();
        assert!(!runner.converge().await.unwrap());
        assert_eq!(current(tree.path(), "dell", "Sequence"), "c;a\n");
        runner.shutdown().await.unwrap();

        let mut runner = Runner::start(Arc::new(make("a;nope"))).await.unwrap();
        assert!(runner.converge().await.is_err());
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reversal_restores_the_pre_apply_value() {
        let tree = tempfile::tempdir().unwrap();
        let mut res = boot_order(tree.path());
        res.meta = MetaParams {
            reverse: true,
            ..MetaParams::default()
        };
        let res = Arc::new(res);
        let mut runner = Runner::start(Arc::clone(&res) as Arc<dyn Resource>)
            .await
            .unwrap();
        runner.converge().await.unwrap();
        assert_eq!(current(tree.path(), "dell", "BootOrder"), "USBHDD\n");

        let reversed = res.as_reversible().unwrap().reversed().unwrap().unwrap();
        runner.shutdown().await.unwrap();

        let mut restore = Runner::start(Arc::from(reversed)).await.unwrap();
        assert!(!restore.converge().await.unwrap());
        assert_eq!(current(tree.path(), "dell", "BootOrder"), "HDD0\n");
        restore.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn watch_reports_external_attribute_changes() {
        let tree = tempfile::tempdir().unwrap();
        let mut res = boot_order(tree.path());
        res.meta = MetaParams {
            poll: Some(std::time::Duration::from_millis(20)),
            ..MetaParams::default()
        };
        let mut runner = Runner::start(Arc::new(res)).await.unwrap();
        runner.converge().await.unwrap();

        // Someone flips the attribute behind our back. The watcher may also
        // report our own earlier write, so keep stepping until the flip has
        // been reconciled.
        write_attr(
            tree.path(),
            "dell",
            "BootOrder",
            &[("current_value", "HDD1")],
        );
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                runner.next_event().await.unwrap();
                if !runner.converge().await.unwrap() {
                    break;
                }
            }
        })
        .await
        .expect("external change was never observed");
        assert_eq!(current(tree.path(), "dell", "BootOrder"), "USBHDD\n");
        runner.shutdown().await.unwrap();
    }
}
