//! Symbol model consumed by the registry.
//!
//! Parsing of symbol files is out of the crate scope, a [`SymbolLoader`] implementation
//! turns a loaded module into a [`SymbolReader`], either a custom one or a
//! prebuilt [`SymbolTable`].

use crate::debugger::error::Error;
use crate::debugger::runtime::{IlOffset, MethodToken, Module};
use serde::Deserialize;
use std::collections::HashMap;

/// Symbol-table entry mapping an IL offset to a source range.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencePoint {
    pub il_offset: IlOffset,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub start_column: u32,
    #[serde(default)]
    pub end_column: u32,
    /// Full path of a source document.
    pub document: String,
}

impl SequencePoint {
    /// Compilers mark IL without user visible source with this line number.
    pub const HIDDEN_LINE: u32 = 0x00fe_efee;

    pub fn is_hidden(&self) -> bool {
        self.start_line == Self::HIDDEN_LINE
    }
}

/// Debug information about a single method.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSymbols {
    pub token: MethodToken,
    /// Fully qualified name, like `App.Program.Main`.
    pub name: String,
    /// Fully qualified parameter type names.
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Size of method IL in bytes.
    pub code_size: u32,
    /// Method is marked as non-user code (compiler generated, `DebuggerNonUserCode`, ...).
    #[serde(default)]
    pub non_user_code: bool,
    /// Sequence points ordered by IL offset.
    #[serde(default)]
    pub sequence_points: Vec<SequencePoint>,
}

impl MethodSymbols {
    /// Return the raw sequence point (it may be hidden) that covers given IL offset.
    pub fn sequence_point_at(&self, il_offset: IlOffset) -> Option<(usize, &SequencePoint)> {
        if self.sequence_points.is_empty() {
            return None;
        }
        let pos = match self
            .sequence_points
            .binary_search_by_key(&il_offset, |sp| sp.il_offset)
        {
            Ok(pos) => pos,
            Err(0) => return None,
            Err(pos) => pos - 1,
        };
        Some((pos, &self.sequence_points[pos]))
    }

    /// First visible sequence point, the place where a method breakpoint is reported.
    pub fn first_visible_point(&self) -> Option<&SequencePoint> {
        self.sequence_points.iter().find(|sp| !sp.is_hidden())
    }

    pub fn is_user_code(&self) -> bool {
        !self.non_user_code
    }
}

/// Source of symbol information for one module.
pub trait SymbolReader: Send + Sync {
    fn methods(&self) -> &[MethodSymbols];

    fn method(&self, token: MethodToken) -> Option<&MethodSymbols> {
        self.methods().iter().find(|m| m.token == token)
    }

    /// Token of the managed entry point if module is an executable.
    fn entry_point(&self) -> Option<MethodToken>;
}

/// Turns a freshly loaded module into its symbol reader.
pub trait SymbolLoader: Send + Sync {
    /// Return `Ok(None)` if module has no symbols.
    fn load(
        &self,
        module: &dyn Module,
        search_paths: &[String],
    ) -> Result<Option<Box<dyn SymbolReader>>, Error>;
}

/// Loader for sessions without symbol support, every module is reported as symbol-less.
pub struct NoSymbols;

impl SymbolLoader for NoSymbols {
    fn load(&self, _: &dyn Module, _: &[String]) -> Result<Option<Box<dyn SymbolReader>>, Error> {
        Ok(None)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbolTable {
    methods: Vec<MethodSymbols>,
    #[serde(default)]
    entry_point: Option<MethodToken>,
}

/// In-memory symbol table.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    methods: Vec<MethodSymbols>,
    entry_point: Option<MethodToken>,
    index: HashMap<MethodToken, usize>,
}

impl SymbolTable {
    pub fn new(mut methods: Vec<MethodSymbols>, entry_point: Option<MethodToken>) -> Self {
        methods
            .iter_mut()
            .for_each(|m| m.sequence_points.sort_by_key(|sp| sp.il_offset));
        let index = methods
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.token, idx))
            .collect();
        Self {
            methods,
            entry_point,
            index,
        }
    }

    /// Build table from its JSON representation (`{"methods": [...], "entryPoint": ...}`).
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let raw: RawSymbolTable = serde_json::from_str(json)?;
        Ok(Self::new(raw.methods, raw.entry_point))
    }
}

impl SymbolReader for SymbolTable {
    fn methods(&self) -> &[MethodSymbols] {
        &self.methods
    }

    fn method(&self, token: MethodToken) -> Option<&MethodSymbols> {
        self.index.get(&token).map(|&idx| &self.methods[idx])
    }

    fn entry_point(&self) -> Option<MethodToken> {
        self.entry_point
    }
}
