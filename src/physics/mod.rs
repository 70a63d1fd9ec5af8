pub mod assembly;
pub mod forms;

pub use assembly::{Assembler, AssemblyInput, FvAssembler};
pub use forms::{Form, FormContainer, FormKind, Kernel, LocalValues, Units};
