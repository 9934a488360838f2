use crate::error::{Error, Result};
use gimli::{EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol};
use std::fs::File;
use std::path::Path;

/// Line table and function symbols of one binary
#[derive(Debug, Default)]
pub struct DwarfInfo {
    /// Address ranges mapped to source locations, sorted by start
    pub ranges: Vec<AddressRange>,
    /// Function symbols, sorted by start address
    pub functions: Vec<FunctionSymbol>,
}

/// An address range mapped to a source location
#[derive(Debug, Clone)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A text symbol with its demangled name
#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub start: u64,
    /// Unsized symbols extend to the next symbol; a trailing one has size 0
    /// and covers nothing
    pub size: u64,
    pub name: String,
}

impl FunctionSymbol {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr - self.start < self.size
    }
}

impl DwarfInfo {
    /// Parse line info and symbols from an ELF file.
    ///
    /// A binary without `.debug_info` still yields function names; one with
    /// neither line info nor symbols is rejected.
    pub fn parse(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }?;

        let object = object::File::parse(&*mmap)
            .map_err(|e| Error::SymbolResolution(format!("Failed to parse ELF: {}", e)))?;

        let functions = Self::parse_functions(&object);

        let ranges = if object.section_by_name(".debug_info").is_some() {
            let endian = if object.is_little_endian() {
                RunTimeEndian::Little
            } else {
                RunTimeEndian::Big
            };
            Self::parse_line_info_from_object(&object, endian)?
        } else if functions.is_empty() {
            return Err(Error::MissingDebugInfo {
                path: path.display().to_string(),
            });
        } else {
            tracing::warn!(
                path = %path.display(),
                "no DWARF line info, reporting function names only"
            );
            Vec::new()
        };

        tracing::debug!(
            ranges = ranges.len(),
            functions = functions.len(),
            "loaded symbols from {}",
            path.display()
        );

        Ok(DwarfInfo { ranges, functions })
    }

    fn parse_line_info_from_object(
        object: &object::File<'_>,
        endian: RunTimeEndian,
    ) -> Result<Vec<AddressRange>> {
        // Missing sections load as empty
        let load_section = |id: gimli::SectionId| -> std::result::Result<_, gimli::Error> {
            let data = object
                .section_by_name(id.name())
                .and_then(|s| s.data().ok())
                .unwrap_or(&[]);
            Ok(EndianSlice::new(data, endian))
        };

        let dwarf = gimli::Dwarf::load(load_section)
            .map_err(|e| Error::SymbolResolution(format!("Failed to load DWARF: {}", e)))?;

        Self::parse_line_info(&dwarf)
    }

    fn parse_line_info(
        dwarf: &gimli::Dwarf<EndianSlice<'_, RunTimeEndian>>,
    ) -> Result<Vec<AddressRange>> {
        let mut ranges = Vec::new();
        let mut units = dwarf.units();

        while let Some(header) = units
            .next()
            .map_err(|e| Error::SymbolResolution(format!("Failed to read unit header: {}", e)))?
        {
            let unit = dwarf
                .unit(header)
                .map_err(|e| Error::SymbolResolution(format!("Failed to parse unit: {}", e)))?;

            let Some(program) = unit.line_program.clone() else {
                continue;
            };

            let mut rows = program.rows();
            let mut prev_row: Option<(u64, String, u32, u32)> = None;

            while let Ok(Some((header, row))) = rows.next_row() {
                let addr = row.address();

                let file = row
                    .file(header)
                    .map(|f| {
                        let mut path = String::new();
                        if let Some(dir) = f.directory(header)
                            && let Ok(dir) = dwarf.attr_string(&unit, dir)
                        {
                            path.push_str(&dir.to_string_lossy());
                            if !path.is_empty() && !path.ends_with('/') {
                                path.push('/');
                            }
                        }
                        if let Ok(name) = dwarf.attr_string(&unit, f.path_name()) {
                            path.push_str(&name.to_string_lossy());
                        }
                        path
                    })
                    .unwrap_or_default();

                let line = row.line().map(|l| l.get() as u32).unwrap_or(0);
                let column = match row.column() {
                    gimli::ColumnType::LeftEdge => 0,
                    gimli::ColumnType::Column(c) => c.get() as u32,
                };

                if let Some((prev_addr, prev_file, prev_line, prev_col)) = prev_row.take()
                    && addr > prev_addr
                    && !prev_file.is_empty()
                {
                    ranges.push(AddressRange {
                        start: prev_addr,
                        end: addr,
                        file: prev_file,
                        line: prev_line,
                        column: prev_col,
                    });
                }

                if !row.end_sequence() {
                    prev_row = Some((addr, file, line, column));
                }
            }
        }

        ranges.sort_by_key(|r| r.start);
        Ok(ranges)
    }

    fn parse_functions(object: &object::File<'_>) -> Vec<FunctionSymbol> {
        let mut functions: Vec<FunctionSymbol> = object
            .symbols()
            .filter(|s| s.kind() == object::SymbolKind::Text && s.address() != 0)
            .filter_map(|s| {
                let name = s.name().ok()?;
                Some(FunctionSymbol {
                    start: s.address(),
                    size: s.size(),
                    name: rustc_demangle::demangle(name).to_string(),
                })
            })
            .collect();

        // Aliases share a start address; keep the sized one.
        functions.sort_by(|a, b| a.start.cmp(&b.start).then(b.size.cmp(&a.size)));
        functions.dedup_by_key(|f| f.start);
        bound_unsized(&mut functions);
        functions
    }
}

/// Give symbols without a recorded size (`_start`, `_fini`) the extent up to
/// the next symbol. `functions` must be sorted by start with unique starts.
fn bound_unsized(functions: &mut [FunctionSymbol]) {
    for i in 0..functions.len() {
        if functions[i].size != 0 {
            continue;
        }
        if let Some(next_start) = functions.get(i + 1).map(|next| next.start) {
            functions[i].size = next_start - functions[i].start;
        }
    }
}
