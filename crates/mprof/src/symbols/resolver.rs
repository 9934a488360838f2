use super::dwarf::{AddressRange, DwarfInfo, FunctionSymbol};
use crate::error::Result;
use std::path::Path;

/// A resolved source location
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function: String,
}

impl Location {
    pub fn unknown() -> Self {
        Location {
            file: "[unknown]".to_string(),
            line: 0,
            column: 0,
            function: "[unknown]".to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.function == "[unknown]" && self.line == 0
    }

    /// Format as file:line
    pub fn as_file_line(&self) -> String {
        if self.line > 0 {
            format!("{}:{}", self.file, self.line)
        } else {
            self.file.clone()
        }
    }
}

/// Maps call-site addresses recorded at runtime to source locations
pub struct SymbolResolver {
    ranges: Vec<AddressRange>,
    functions: Vec<FunctionSymbol>,
    /// Runtime load address of the binary (0 for non-PIE)
    load_base: u64,
}

impl SymbolResolver {
    /// Load symbols from the binary the snapshot was recorded from.
    pub fn from_binary(path: &Path, load_base: u64) -> Result<Self> {
        let dwarf = DwarfInfo::parse(path)?;
        Ok(Self::from_dwarf(dwarf, load_base))
    }

    pub fn from_dwarf(dwarf: DwarfInfo, load_base: u64) -> Self {
        SymbolResolver {
            ranges: dwarf.ranges,
            functions: dwarf.functions,
            load_base,
        }
    }

    /// Number of address ranges loaded
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn load_base(&self) -> u64 {
        self.load_base
    }

    /// Resolve a recorded call-site address.
    ///
    /// Call sites are return addresses, so the lookup uses the byte before
    /// them: the last byte of the call instruction.
    pub fn resolve(&self, addr: u64) -> Location {
        if addr == 0 || addr < self.load_base {
            return Location::unknown();
        }
        let debug_addr = (addr - self.load_base).saturating_sub(1);

        let function = self.find_function(debug_addr);

        match self.find_range(debug_addr) {
            Some(range) => Location {
                file: simplify_path(&range.file),
                line: range.line,
                column: range.column,
                function: function.unwrap_or_else(|| "[unknown]".to_string()),
            },
            None => match function {
                Some(function) => Location {
                    file: "[no line info]".to_string(),
                    line: 0,
                    column: 0,
                    function,
                },
                None => Location::unknown(),
            },
        }
    }

    fn find_range(&self, addr: u64) -> Option<&AddressRange> {
        // Last range starting at or before addr
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (addr < range.end).then_some(range)
    }

    fn find_function(&self, addr: u64) -> Option<String> {
        let idx = self.functions.partition_point(|f| f.start <= addr);
        let func = self.functions.get(idx.checked_sub(1)?)?;
        func.contains(addr).then(|| func.name.clone())
    }
}

/// Simplify a file path for display
pub fn simplify_path(path: &str) -> String {
    if path.starts_with('[') {
        return path.to_string();
    }

    // Standard library sources: keep only the file name
    if (path.contains("/rust/library/") || path.contains("/rustc/"))
        && let Some(filename) = path.rsplit('/').next()
    {
        return format!("<std>/{}", filename);
    }

    // Registry dependencies: <crate-version>/path/in/src
    const REGISTRY: &str = "/.cargo/registry/src/";
    if let Some(idx) = path.find(REGISTRY) {
        let mut parts = path[idx + REGISTRY.len()..].splitn(3, '/');
        if let (Some(_index), Some(krate), Some(tail)) = (parts.next(), parts.next(), parts.next()) {
            let tail = tail.strip_prefix("src/").unwrap_or(tail);
            return format!("<{}>/{}", krate, tail);
        }
    }

    if let Some(idx) = path.find("/src/") {
        return path[idx + 1..].to_string();
    }

    if let Some(idx) = path.find("/examples/") {
        return path[idx + 1..].to_string();
    }

    path.rsplit('/').next().unwrap_or(path).to_string()
}
