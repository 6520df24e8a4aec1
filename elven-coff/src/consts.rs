#![allow(non_upper_case_globals)]

// Mirrors elven_parser::consts's macro shape exactly: the wire-level
// constants of the PE/COFF family, grouped into small `Pod` wrapper
// structs with shared Debug/Display/PartialEq plumbing.

macro_rules! const_group_with_fmt {
    (
        pub struct $struct_name:ident($ty:ty): $group_name:literal

        $(
            pub const $name:ident = $value:expr;
        )*
    ) => {
        $(
            pub const $name: $ty = $value;
        )*

        #[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
        #[repr(transparent)]
        pub struct $struct_name(pub $ty);

        impl From<$ty> for $struct_name {
            fn from(value: $ty) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Debug for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self.0 {
                    $(
                        $value => f.write_str(stringify!($name)),
                    )*
                    a => write!(f, "{}({a})", $group_name)
                }
            }
        }

        impl std::fmt::Display for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(self, f)
            }
        }

        impl PartialEq<$ty> for $struct_name {
            fn eq(&self, other: &$ty) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$struct_name> for $ty {
            fn eq(&self, other: &$struct_name) -> bool {
               *self == other.0
            }
        }
    };
}

macro_rules! const_flags_with_fmt {
    (
        pub struct $struct_name:ident($ty:ty): $group_name:literal

        $(
            pub const $name:ident = $value:expr;
        )*
    ) => {
        $(
            pub const $name: $ty = $value;
        )*

        #[derive(Clone, Copy, PartialEq, Eq, bytemuck::Zeroable, bytemuck::Pod)]
        #[repr(transparent)]
        pub struct $struct_name(pub $ty);

        impl $struct_name {
            $(
                pub const $name: Self = Self($value);
            )*

            pub fn contains(self, other: $ty) -> bool {
                self.0 & other == other
            }
        }

        impl std::ops::BitOr for $struct_name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::fmt::Debug for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut remaining = self.0;
                let mut first = true;
                $(
                    if remaining & $value == $value && $value != 0 {
                        if !first { f.write_str("|")?; }
                        f.write_str(stringify!($name))?;
                        first = false;
                        remaining &= !$value;
                    }
                )*
                if remaining != 0 || first {
                    if !first { f.write_str("|")?; }
                    write!(f, "{}({:#x})", $group_name, remaining)?;
                }
                Ok(())
            }
        }

        impl PartialEq<$ty> for $struct_name {
            fn eq(&self, other: &$ty) -> bool {
                self.0 == *other
            }
        }
    };
}

// ------------------
// Archive short import header (winnt.h IMPORT_OBJECT_HEADER)
// ------------------

pub const IMPORT_OBJECT_HDR_SIG2: u16 = 0xffff;

const_group_with_fmt! {
    pub struct ImportType(u16): "import-type"

    pub const IMPORT_CODE = 0;
    pub const IMPORT_DATA = 1;
    pub const IMPORT_CONST = 2;
}

const_group_with_fmt! {
    pub struct ImportNameType(u16): "import-name-type"

    pub const IMPORT_ORDINAL = 0;
    pub const IMPORT_NAME = 1;
    pub const IMPORT_NAME_NOPREFIX = 2;
    pub const IMPORT_NAME_UNDECORATE = 3;
}

// ------------------
// COFF file header (IMAGE_FILE_HEADER)
// ------------------

const_group_with_fmt! {
    pub struct Machine(u16): "machine"

    pub const IMAGE_FILE_MACHINE_UNKNOWN = 0x0;
    pub const IMAGE_FILE_MACHINE_I386 = 0x14c;
    pub const IMAGE_FILE_MACHINE_AMD64 = 0x8664;
    pub const IMAGE_FILE_MACHINE_ARM = 0x1c0;
    pub const IMAGE_FILE_MACHINE_ARM64 = 0xaa64;
    pub const IMAGE_FILE_MACHINE_ARMNT = 0x1c4;
}

const_flags_with_fmt! {
    pub struct Characteristics(u16): "characteristics"

    pub const IMAGE_FILE_RELOCS_STRIPPED = 0x0001;
    pub const IMAGE_FILE_EXECUTABLE_IMAGE = 0x0002;
    pub const IMAGE_FILE_LINE_NUMS_STRIPPED = 0x0004;
    pub const IMAGE_FILE_LOCAL_SYMS_STRIPPED = 0x0008;
    pub const IMAGE_FILE_LARGE_ADDRESS_AWARE = 0x0020;
    pub const IMAGE_FILE_DEBUG_STRIPPED = 0x0200;
    pub const IMAGE_FILE_DLL = 0x2000;
}

// ------------------
// Section header (IMAGE_SECTION_HEADER::Characteristics)
// ------------------

const_flags_with_fmt! {
    pub struct SectionFlags(u32): "section-flags"

    pub const IMAGE_SCN_TYPE_NOLOAD = 0x0000_0002;
    pub const IMAGE_SCN_CNT_CODE = 0x0000_0020;
    pub const IMAGE_SCN_CNT_INITIALIZED_DATA = 0x0000_0040;
    pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA = 0x0000_0080;
    pub const IMAGE_SCN_LNK_INFO = 0x0000_0200;
    pub const IMAGE_SCN_LNK_REMOVE = 0x0000_0800;
    pub const IMAGE_SCN_LNK_COMDAT = 0x0000_1000;
    pub const IMAGE_SCN_GPREL = 0x0000_8000;
    pub const IMAGE_SCN_MEM_PURGEABLE = 0x0002_0000;
    pub const IMAGE_SCN_MEM_16BIT = 0x0002_0000;
    pub const IMAGE_SCN_MEM_LOCKED = 0x0004_0000;
    pub const IMAGE_SCN_MEM_PRELOAD = 0x0008_0000;
    pub const IMAGE_SCN_LNK_NRELOC_OVFL = 0x0100_0000;
    pub const IMAGE_SCN_MEM_DISCARDABLE = 0x0200_0000;
    pub const IMAGE_SCN_MEM_NOT_CACHED = 0x0400_0000;
    pub const IMAGE_SCN_MEM_NOT_PAGED = 0x0800_0000;
    pub const IMAGE_SCN_MEM_SHARED = 0x1000_0000;
    pub const IMAGE_SCN_MEM_EXECUTE = 0x2000_0000;
    pub const IMAGE_SCN_MEM_READ = 0x4000_0000;
    pub const IMAGE_SCN_MEM_WRITE = 0x8000_0000;
}

/// Alignment is encoded in bits 20..24 of the characteristics word as
/// `log2(align) + 1`, one of sixteen values (`IMAGE_SCN_ALIGN_1BYTES` ..
/// `IMAGE_SCN_ALIGN_8192BYTES`).
pub fn section_alignment(characteristics: u32) -> u64 {
    let code = (characteristics >> 20) & 0xf;
    if code == 0 {
        return 1;
    }
    1u64 << (code - 1)
}

// ------------------
// COMDAT selection (IMAGE_COMDAT_SELECT_*)
// ------------------

const_group_with_fmt! {
    pub struct ComdatSelect(u8): "comdat-select"

    pub const IMAGE_COMDAT_SELECT_NODUPLICATES = 1;
    pub const IMAGE_COMDAT_SELECT_ANY = 2;
    pub const IMAGE_COMDAT_SELECT_SAME_SIZE = 3;
    pub const IMAGE_COMDAT_SELECT_EXACT_MATCH = 4;
    pub const IMAGE_COMDAT_SELECT_ASSOCIATIVE = 5;
    pub const IMAGE_COMDAT_SELECT_LARGEST = 6;
}

// ------------------
// Symbol table (IMAGE_SYMBOL)
// ------------------

const_group_with_fmt! {
    pub struct StorageClass(u8): "storage-class"

    pub const IMAGE_SYM_CLASS_END_OF_FUNCTION = 0xff;
    pub const IMAGE_SYM_CLASS_NULL = 0;
    pub const IMAGE_SYM_CLASS_AUTOMATIC = 1;
    pub const IMAGE_SYM_CLASS_EXTERNAL = 2;
    pub const IMAGE_SYM_CLASS_STATIC = 3;
    pub const IMAGE_SYM_CLASS_LABEL = 6;
    pub const IMAGE_SYM_CLASS_MEMBER_OF_STRUCT = 10;
    pub const IMAGE_SYM_CLASS_FUNCTION = 101;
    pub const IMAGE_SYM_CLASS_FILE = 103;
    pub const IMAGE_SYM_CLASS_SECTION = 104;
    pub const IMAGE_SYM_CLASS_WEAK_EXTERNAL = 105;
}

pub const IMAGE_SYM_UNDEFINED: i16 = 0;
pub const IMAGE_SYM_ABSOLUTE: i16 = -1;
pub const IMAGE_SYM_DEBUG: i16 = -2;

/// `IMAGE_WEAK_EXTERN_*` characteristics of a weak-external auxiliary record.
const_group_with_fmt! {
    pub struct WeakExternCharacteristics(u32): "weak-extern"

    pub const IMAGE_WEAK_EXTERN_SEARCH_NOLIBRARY = 1;
    pub const IMAGE_WEAK_EXTERN_SEARCH_LIBRARY = 2;
    pub const IMAGE_WEAK_EXTERN_SEARCH_ALIAS = 3;
    pub const IMAGE_WEAK_EXTERN_ANTI_DEPENDENCY = 4;
}

// ------------------
// Relocations (I386/AMD64)
// ------------------

const_group_with_fmt! {
    pub struct RelocAmd64(u16): "IMAGE_REL_AMD64"

    pub const IMAGE_REL_AMD64_ABSOLUTE = 0x0000;
    pub const IMAGE_REL_AMD64_ADDR64 = 0x0001;
    pub const IMAGE_REL_AMD64_ADDR32 = 0x0002;
    pub const IMAGE_REL_AMD64_ADDR32NB = 0x0003;
    pub const IMAGE_REL_AMD64_REL32 = 0x0004;
    pub const IMAGE_REL_AMD64_REL32_1 = 0x0005;
    pub const IMAGE_REL_AMD64_REL32_2 = 0x0006;
    pub const IMAGE_REL_AMD64_REL32_3 = 0x0007;
    pub const IMAGE_REL_AMD64_REL32_4 = 0x0008;
    pub const IMAGE_REL_AMD64_REL32_5 = 0x0009;
    pub const IMAGE_REL_AMD64_SECTION = 0x000A;
    pub const IMAGE_REL_AMD64_SECREL = 0x000B;
    pub const IMAGE_REL_AMD64_SECREL7 = 0x000C;
    pub const IMAGE_REL_AMD64_TOKEN = 0x000D;
    pub const IMAGE_REL_AMD64_SREL32 = 0x000E;
    pub const IMAGE_REL_AMD64_PAIR = 0x000F;
    pub const IMAGE_REL_AMD64_SSPAN32 = 0x0010;
}

const_group_with_fmt! {
    pub struct RelocI386(u16): "IMAGE_REL_I386"

    pub const IMAGE_REL_I386_ABSOLUTE = 0x0000;
    pub const IMAGE_REL_I386_DIR16 = 0x0001;
    pub const IMAGE_REL_I386_REL16 = 0x0002;
    pub const IMAGE_REL_I386_DIR32 = 0x0006;
    pub const IMAGE_REL_I386_DIR32NB = 0x0007;
    pub const IMAGE_REL_I386_SECTION = 0x000A;
    pub const IMAGE_REL_I386_SECREL = 0x000B;
    pub const IMAGE_REL_I386_REL32 = 0x0014;
}

// ------------------
// PE optional header
// ------------------

pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;

const_group_with_fmt! {
    pub struct Subsystem(u16): "subsystem"

    pub const IMAGE_SUBSYSTEM_UNKNOWN = 0;
    pub const IMAGE_SUBSYSTEM_NATIVE = 1;
    pub const IMAGE_SUBSYSTEM_WINDOWS_GUI = 2;
    pub const IMAGE_SUBSYSTEM_WINDOWS_CUI = 3;
    pub const IMAGE_SUBSYSTEM_EFI_APPLICATION = 10;
}

const_flags_with_fmt! {
    pub struct DllCharacteristics(u16): "dll-characteristics"

    pub const IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA = 0x0020;
    pub const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE = 0x0040;
    pub const IMAGE_DLLCHARACTERISTICS_NX_COMPAT = 0x0100;
    pub const IMAGE_DLLCHARACTERISTICS_NO_ISOLATION = 0x0200;
    pub const IMAGE_DLLCHARACTERISTICS_NO_SEH = 0x0400;
    pub const IMAGE_DLLCHARACTERISTICS_NO_BIND = 0x0800;
    pub const IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE = 0x8000;
}

pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
pub const IMAGE_DIRECTORY_ENTRY_EXCEPTION: usize = 3;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
pub const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;
pub const IMAGE_DIRECTORY_ENTRY_TLS: usize = 9;
pub const IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG: usize = 10;
pub const IMAGE_DIRECTORY_ENTRY_IAT: usize = 12;

pub const DOS_STUB_SIZE: usize = 128;
pub const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";

pub const DEFAULT_FILE_ALIGNMENT: u32 = 0x200;
pub const DEFAULT_SECTION_ALIGNMENT: u32 = 0x1000;
pub const DEFAULT_IMAGE_BASE_EXE: u64 = 0x1_4000_0000;
pub const DEFAULT_IMAGE_BASE_DLL: u64 = 0x1_8000_0000;
