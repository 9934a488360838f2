mod dwarf;
mod resolver;

pub use dwarf::{AddressRange, DwarfInfo, FunctionSymbol};
pub use resolver::{Location, SymbolResolver};
