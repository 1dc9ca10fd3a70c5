//! Debug-Info Registry: loaded modules with their symbols, IL offset to source
//! mapping and source path index.

pub mod source;
pub mod symbols;

pub use source::{canonicalize, SourceIndex};
pub use symbols::{MethodSymbols, NoSymbols, SequencePoint, SymbolLoader, SymbolReader, SymbolTable};

use crate::debugger::config::DebuggerConfig;
use crate::debugger::error::Error;
use crate::debugger::runtime::{
    Frame, IlOffset, IlRange, MethodToken, Module, ModuleAddress, Thread,
};
use crate::{muted_error, weak_error};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolStatus {
    /// Symbols are never loaded for this module (dynamic or in-memory module).
    Skipped,
    Loaded,
    NotFound,
}

impl SymbolStatus {
    fn as_message(self) -> &'static str {
        match self {
            SymbolStatus::Skipped => "Skipped loading symbols.",
            SymbolStatus::Loaded => "Symbols loaded.",
            SymbolStatus::NotFound => "Symbols not found.",
        }
    }
}

/// Module description as it shown to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleView {
    pub id: String,
    pub name: String,
    pub path: String,
    pub symbol_status: String,
    pub address_range: String,
    #[serde(skip)]
    pub base_address: ModuleAddress,
    #[serde(skip)]
    pub status: SymbolStatus,
}

struct ModuleRecord {
    id: String,
    name: String,
    path: String,
    status: SymbolStatus,
    module: Arc<dyn Module>,
    symbols: Option<Box<dyn SymbolReader>>,
}

impl ModuleRecord {
    fn view(&self) -> ModuleView {
        ModuleView {
            id: self.id.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            symbol_status: self.status.as_message().to_string(),
            address_range: format!("{:#018x}", self.module.base_address()),
            base_address: self.module.base_address(),
            status: self.status,
        }
    }

    fn method(&self, token: MethodToken) -> Result<&MethodSymbols, Error> {
        self.symbols
            .as_ref()
            .ok_or_else(|| Error::NoSymbols(self.name.clone()))?
            .method(token)
            .ok_or(Error::MethodNotFound(token.0))
    }
}

/// A place in the code where a line breakpoint is armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSite {
    pub module: ModuleAddress,
    pub token: MethodToken,
    pub il_offset: IlOffset,
    pub line: u32,
    pub end_line: u32,
    pub source_index: u32,
}

/// A method that matches a function breakpoint.
#[derive(Clone)]
pub struct FunctionMatch {
    pub module: Arc<dyn Module>,
    pub token: MethodToken,
    /// Method name as it is written in symbols.
    pub name: String,
    /// First visible sequence point, used for the breakpoint view.
    pub source_path: Option<String>,
    pub line: Option<u32>,
    pub end_line: Option<u32>,
}

/// Entry point of an executable module.
#[derive(Clone)]
pub struct EntryPoint {
    pub module: Arc<dyn Module>,
    pub token: MethodToken,
    pub il_offset: IlOffset,
}

#[derive(Default)]
struct RegistryInner {
    modules: IndexMap<ModuleAddress, ModuleRecord>,
    sources: SourceIndex,
}

/// Registry of loaded modules and their symbols.
#[derive(Default)]
pub struct DebugInfoRegistry {
    inner: RwLock<RegistryInner>,
}

/// Normalize a function signature: collapse whitespace, drop spaces around punctuation.
fn normalize_params(params: &str) -> String {
    static SPACES: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\s+").expect("valid regex"));
    static PUNCT_SPACES: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"\s*([,()\[\]<>])\s*").expect("valid regex")
    });

    let collapsed = SPACES.replace_all(params.trim(), " ");
    let tight = PUNCT_SPACES.replace_all(&collapsed, "$1");
    let tight = tight.trim();
    let tight = tight.strip_prefix('(').unwrap_or(tight);
    tight.strip_suffix(')').unwrap_or(tight).to_string()
}

/// True if `qualified` (like `App.Program.Main`) is addressed by `requested`
/// (like `Main`, `Program.Main` or full name).
fn function_name_matches(qualified: &str, requested: &str) -> bool {
    if qualified == requested {
        return true;
    }
    qualified
        .strip_suffix(requested)
        .map(|prefix| prefix.ends_with('.'))
        .unwrap_or(false)
}

impl DebugInfoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loaded module, load its symbols and apply Just-My-Code status.
    pub fn add_module(
        &self,
        module: Arc<dyn Module>,
        loader: &dyn SymbolLoader,
        config: &DebuggerConfig,
    ) -> ModuleView {
        let base = module.base_address();
        let path = weak_error!(module.path(), "module path:").unwrap_or_default();
        let name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{base:#x}"));
        let id = muted_error!(module.mvid(), "module mvid:")
            .unwrap_or_else(uuid::Uuid::new_v4)
            .to_string();

        let (status, symbols) = if module.is_dynamic() {
            (SymbolStatus::Skipped, None)
        } else {
            match loader.load(module.as_ref(), &config.symbol_search_paths) {
                Ok(Some(symbols)) => (SymbolStatus::Loaded, Some(symbols)),
                Ok(None) => (SymbolStatus::NotFound, None),
                Err(e) => {
                    log::warn!(target: "debugger", "load symbols for {path}: {e:#}");
                    (SymbolStatus::NotFound, None)
                }
            }
        };

        if config.just_my_code {
            let jmc = match symbols.as_ref() {
                Some(symbols) => {
                    let non_user = symbols
                        .methods()
                        .iter()
                        .filter(|m| m.non_user_code)
                        .map(|m| m.token)
                        .collect_vec();
                    module.set_jmc_status(true, &non_user)
                }
                None => module.set_jmc_status(false, &[]),
            };
            weak_error!(jmc, "set module jmc status:");
        }

        let record = ModuleRecord {
            id,
            name,
            path,
            status,
            module,
            symbols,
        };
        let view = record.view();

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(symbols) = record.symbols.as_ref() {
            let documents: HashSet<String> = symbols
                .methods()
                .iter()
                .flat_map(|m| m.sequence_points.iter())
                .map(|sp| canonicalize(&sp.document))
                .collect();
            for doc in documents.into_iter().sorted() {
                inner.sources.get_or_insert(&doc);
            }
        }
        if let Some(mut stale) = inner.modules.insert(base, record) {
            log::warn!(target: "debugger", "module at {base:#x} loaded twice, replace record");
            stale.symbols.take();
        }

        log::debug!(target: "debugger", "module {} loaded ({:?})", view.path, view.status);
        view
    }

    /// Forget module, symbol reader is released before the module handle.
    pub fn remove_module(&self, base: ModuleAddress) -> Option<ModuleView> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut record = inner.modules.shift_remove(&base)?;
        record.symbols.take();
        Some(record.view())
    }

    pub fn modules(&self) -> Vec<ModuleView> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.modules.values().map(ModuleRecord::view).collect()
    }

    pub fn module_addresses(&self) -> Vec<ModuleAddress> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.modules.keys().copied().collect()
    }

    pub fn module_handle(&self, base: ModuleAddress) -> Option<Arc<dyn Module>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.modules.get(&base).map(|r| r.module.clone())
    }

    /// Resolve a source line into verified sites inside one module.
    ///
    /// Nearest forward sequence point wins, a line shared by several methods
    /// (constructor field initializers) gives a site per method.
    pub fn resolve_breakpoint(
        &self,
        base: ModuleAddress,
        source_path: &str,
        line: u32,
    ) -> Result<Vec<VerifiedSite>, Error> {
        let requested = canonicalize(source_path);
        let inner = self.inner.read().expect("registry lock poisoned");
        let record = inner.modules.get(&base).ok_or(Error::ModuleNotFound(base))?;
        let Some(symbols) = record.symbols.as_ref() else {
            return Ok(vec![]);
        };

        // best candidate per method: (line, il offset, point)
        let mut candidates: Vec<(MethodToken, &SequencePoint, String)> = vec![];
        for method in symbols.methods() {
            let best = method
                .sequence_points
                .iter()
                .filter(|sp| !sp.is_hidden() && sp.start_line >= line)
                .filter_map(|sp| {
                    let doc = canonicalize(&sp.document);
                    source::path_matches(&doc, &requested).then_some((sp, doc))
                })
                .min_by_key(|(sp, _)| (sp.start_line, sp.il_offset));
            if let Some((sp, doc)) = best {
                candidates.push((method.token, sp, doc));
            }
        }

        let Some(best_line) = candidates.iter().map(|(_, sp, _)| sp.start_line).min() else {
            return Ok(vec![]);
        };

        let sites = candidates
            .into_iter()
            .filter(|(_, sp, _)| sp.start_line == best_line)
            .filter_map(|(token, sp, doc)| {
                let source_index = inner.sources.index_of(&doc)?;
                Some(VerifiedSite {
                    module: base,
                    token,
                    il_offset: sp.il_offset,
                    line: sp.start_line,
                    end_line: sp.end_line,
                    source_index,
                })
            })
            .sorted_by_key(|site| (site.token, site.il_offset))
            .collect();
        Ok(sites)
    }

    pub fn source_path_by_index(&self, idx: u32) -> Option<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.sources.path_of(idx).map(ToString::to_string)
    }

    pub fn index_by_source_path(&self, path: &str) -> Option<u32> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.sources.index_of(&canonicalize(path))
    }

    /// Return frame IL offset and the sequence point covering it.
    ///
    /// If IL offset falls into a hidden region the nearest visible point before it is used.
    pub fn frame_il_and_sequence_point(
        &self,
        frame: &dyn Frame,
    ) -> Result<(IlOffset, SequencePoint), Error> {
        let (il, _) = frame.ip()?;
        let function = frame.function()?;
        let base = function.module()?.base_address();

        let inner = self.inner.read().expect("registry lock poisoned");
        let record = inner.modules.get(&base).ok_or(Error::ModuleNotFound(base))?;
        let method = record.method(function.token())?;
        let (pos, _) = method
            .sequence_point_at(il)
            .ok_or(Error::NoSequencePoint(il))?;
        let sp = method.sequence_points[..=pos]
            .iter()
            .rev()
            .find(|sp| !sp.is_hidden())
            .ok_or(Error::NoSequencePoint(il))?;
        Ok((il, sp.clone()))
    }

    /// True if frame stays on a visible sequence point of a user method.
    pub fn is_user_code_location(&self, frame: &dyn Frame) -> Result<bool, Error> {
        let (il, _) = frame.ip()?;
        let function = frame.function()?;
        let base = function.module()?.base_address();

        let inner = self.inner.read().expect("registry lock poisoned");
        let Some(record) = inner.modules.get(&base) else {
            return Ok(false);
        };
        let Ok(method) = record.method(function.token()) else {
            return Ok(false);
        };
        Ok(method.is_user_code()
            && method
                .sequence_point_at(il)
                .map(|(_, sp)| !sp.is_hidden())
                .unwrap_or(false))
    }

    /// True if method has symbols and is not marked as non-user code.
    pub fn is_user_method(&self, base: ModuleAddress, token: MethodToken) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .modules
            .get(&base)
            .and_then(|record| record.method(token).ok())
            .map(MethodSymbols::is_user_code)
            .unwrap_or(false)
    }

    /// Find methods matched by a function breakpoint in every loaded module.
    ///
    /// Callback is called out of the registry lock.
    pub fn resolve_function_breakpoint_in_any(
        &self,
        name: &str,
        params: Option<&str>,
        mut cb: impl FnMut(FunctionMatch) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for m in self.find_functions(None, name, params) {
            cb(m)?;
        }
        Ok(())
    }

    /// Same as [`DebugInfoRegistry::resolve_function_breakpoint_in_any`] but for a single module.
    pub fn resolve_function_breakpoint(
        &self,
        base: ModuleAddress,
        name: &str,
        params: Option<&str>,
    ) -> Vec<FunctionMatch> {
        self.find_functions(Some(base), name, params)
    }

    fn find_functions(
        &self,
        only: Option<ModuleAddress>,
        name: &str,
        params: Option<&str>,
    ) -> Vec<FunctionMatch> {
        let params = params.map(normalize_params);
        let inner = self.inner.read().expect("registry lock poisoned");

        inner
            .modules
            .iter()
            .filter(|(base, _)| only.map(|only| only == **base).unwrap_or(true))
            .filter_map(|(_, record)| Some((record, record.symbols.as_ref()?)))
            .flat_map(|(record, symbols)| {
                symbols
                    .methods()
                    .iter()
                    .filter(|m| function_name_matches(&m.name, name))
                    .filter(|m| match params.as_ref() {
                        None => true,
                        Some(params) => normalize_params(&m.parameters.join(",")) == *params,
                    })
                    .map(|m| {
                        let first = m.first_visible_point();
                        FunctionMatch {
                            module: record.module.clone(),
                            token: m.token,
                            name: m.name.clone(),
                            source_path: first.map(|sp| canonicalize(&sp.document)),
                            line: first.map(|sp| sp.start_line),
                            end_line: first.map(|sp| sp.end_line),
                        }
                    })
            })
            .collect()
    }

    /// Return IL range of a statement that contains current thread IP.
    pub fn step_range_from_current_ip(&self, thread: &dyn Thread) -> Result<IlRange, Error> {
        let frame = thread
            .active_frame()?
            .ok_or(Error::ThreadNotFound(thread.id()))?;
        let (il, _) = frame.ip()?;
        let function = frame.function()?;
        let base = function.module()?.base_address();

        let inner = self.inner.read().expect("registry lock poisoned");
        let record = inner.modules.get(&base).ok_or(Error::ModuleNotFound(base))?;
        let method = record.method(function.token())?;
        let points = &method.sequence_points;

        let range = match method.sequence_point_at(il) {
            Some((pos, sp)) => IlRange {
                start: sp.il_offset,
                end: points
                    .get(pos + 1..)
                    .and_then(|rest| rest.iter().find(|next| next.il_offset > sp.il_offset))
                    .map(|next| next.il_offset)
                    .unwrap_or(method.code_size),
            },
            None => IlRange {
                start: 0,
                end: points
                    .first()
                    .map(|sp| sp.il_offset)
                    .unwrap_or(method.code_size),
            },
        };
        Ok(range)
    }

    /// Return first IL offset at or after `il_offset` that belongs to a visible sequence point.
    pub fn next_user_code_il_offset_in_method(
        &self,
        base: ModuleAddress,
        token: MethodToken,
        il_offset: IlOffset,
    ) -> Result<IlOffset, Error> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let record = inner.modules.get(&base).ok_or(Error::ModuleNotFound(base))?;
        let method = record.method(token)?;
        if method.non_user_code {
            return Err(Error::NoUserCode(il_offset));
        }
        method
            .sequence_points
            .iter()
            .find(|sp| sp.il_offset >= il_offset && !sp.is_hidden())
            .map(|sp| sp.il_offset)
            .ok_or(Error::NoUserCode(il_offset))
    }

    /// Managed entry point of a module, if any.
    pub fn entry_point(&self, base: ModuleAddress) -> Option<EntryPoint> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let record = inner.modules.get(&base)?;
        let symbols = record.symbols.as_ref()?;
        let token = symbols.entry_point()?;
        let il_offset = symbols
            .method(token)
            .and_then(|m| m.first_visible_point())
            .map(|sp| sp.il_offset)
            .unwrap_or(0);
        Some(EntryPoint {
            module: record.module.clone(),
            token,
            il_offset,
        })
    }

    /// Method name from symbols.
    pub fn method_name(&self, base: ModuleAddress, token: MethodToken) -> Option<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let record = inner.modules.get(&base)?;
        record.method(token).ok().map(|m| m.name.clone())
    }

    pub fn module_name(&self, base: ModuleAddress) -> Option<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.modules.get(&base).map(|r| r.name.clone())
    }
}
