//! Element and attribute ids of the compiled specification stream.
//!
//! Ids are scoped: every id below belongs to scope 1, the
//! specification scope. The numbering is part of the wire format and
//! must never be reordered.

#![allow(missing_docs)]

/// Magic bytes opening a compiled specification file.
pub const MAGIC: [u8; 3] = *b"sla";

/// Format version this reader produces and consumes.
pub const FORMAT_VERSION: u8 = 4;

/// Range of specification versions accepted inside the stream.
pub const MIN_SPEC_VERSION: u64 = 4;
/// Newest accepted in-stream specification version.
pub const MAX_SPEC_VERSION: u64 = 30;

/// Scope all ids below belong to.
pub const SCOPE: u16 = 1;

// Top-level elements.
pub const ELEM_SLEIGH: u16 = 1;
pub const ELEM_SOURCEFILES: u16 = 2;
pub const ELEM_SOURCEFILE: u16 = 3;
pub const ELEM_SPACES: u16 = 4;
pub const ELEM_SPACE: u16 = 5;
pub const ELEM_SPACE_UNIQUE: u16 = 6;
pub const ELEM_SPACE_OTHER: u16 = 7;
pub const ELEM_SYMBOL_TABLE: u16 = 8;

// Patterns.
pub const ELEM_INSTRUCT_PAT: u16 = 9;
pub const ELEM_CONTEXT_PAT: u16 = 10;
pub const ELEM_COMBINE_PAT: u16 = 11;
pub const ELEM_OR_PAT: u16 = 12;
pub const ELEM_PAT_BLOCK: u16 = 13;
pub const ELEM_MASK_WORD: u16 = 14;

// Symbol table scaffolding.
pub const ELEM_SCOPE: u16 = 15;

// Symbol headers; every symbol is announced by a header carrying its
// name, id, and scope before any content element appears.
pub const ELEM_USEROP_HEAD: u16 = 16;
pub const ELEM_EPSILON_SYM_HEAD: u16 = 17;
pub const ELEM_VALUE_SYM_HEAD: u16 = 18;
pub const ELEM_VALUEMAP_SYM_HEAD: u16 = 19;
pub const ELEM_NAME_SYM_HEAD: u16 = 20;
pub const ELEM_VARNODE_SYM_HEAD: u16 = 21;
pub const ELEM_VARLIST_SYM_HEAD: u16 = 22;
pub const ELEM_CONTEXT_SYM_HEAD: u16 = 23;
pub const ELEM_OPERAND_SYM_HEAD: u16 = 24;
pub const ELEM_START_SYM_HEAD: u16 = 25;
pub const ELEM_END_SYM_HEAD: u16 = 26;
pub const ELEM_NEXT2_SYM_HEAD: u16 = 27;
pub const ELEM_SUBTABLE_SYM_HEAD: u16 = 28;
pub const ELEM_FLOWDEST_SYM_HEAD: u16 = 29;
pub const ELEM_FLOWREF_SYM_HEAD: u16 = 30;

// Symbol contents.
pub const ELEM_VALUE_SYM: u16 = 31;
pub const ELEM_VALUEMAP_SYM: u16 = 32;
pub const ELEM_NAME_SYM: u16 = 33;
pub const ELEM_VARNODE_SYM: u16 = 34;
pub const ELEM_VARLIST_SYM: u16 = 35;
pub const ELEM_CONTEXT_SYM: u16 = 36;
pub const ELEM_OPERAND_SYM: u16 = 37;
pub const ELEM_SUBTABLE_SYM: u16 = 38;
pub const ELEM_VALUETAB: u16 = 39;
pub const ELEM_NAMETAB: u16 = 40;
pub const ELEM_VAR: u16 = 41;

// Constructors and decision trees.
pub const ELEM_CONSTRUCTOR: u16 = 42;
pub const ELEM_OPER: u16 = 43;
pub const ELEM_PRINT: u16 = 44;
pub const ELEM_OPPRINT: u16 = 45;
pub const ELEM_CONTEXT_OP: u16 = 46;
pub const ELEM_COMMIT: u16 = 47;
pub const ELEM_DECISION: u16 = 48;
pub const ELEM_PAIR: u16 = 49;

// Templates.
pub const ELEM_CONSTRUCT_TPL: u16 = 50;
pub const ELEM_OP_TPL: u16 = 51;
pub const ELEM_VARNODE_TPL: u16 = 52;
pub const ELEM_CONST_TPL: u16 = 53;
pub const ELEM_HANDLE_TPL: u16 = 54;
pub const ELEM_NULL: u16 = 55;

// Pattern expressions.
pub const ELEM_TOKENFIELD_EXP: u16 = 56;
pub const ELEM_CONTEXTFIELD_EXP: u16 = 57;
pub const ELEM_INTB_EXP: u16 = 58;
pub const ELEM_OPERAND_EXP: u16 = 59;
pub const ELEM_START_EXP: u16 = 60;
pub const ELEM_END_EXP: u16 = 61;
pub const ELEM_NEXT2_EXP: u16 = 62;
pub const ELEM_PLUS_EXP: u16 = 63;
pub const ELEM_SUB_EXP: u16 = 64;
pub const ELEM_MULT_EXP: u16 = 65;
pub const ELEM_LSHIFT_EXP: u16 = 66;
pub const ELEM_RSHIFT_EXP: u16 = 67;
pub const ELEM_AND_EXP: u16 = 68;
pub const ELEM_OR_EXP: u16 = 69;
pub const ELEM_XOR_EXP: u16 = 70;
pub const ELEM_DIV_EXP: u16 = 71;
pub const ELEM_MINUS_EXP: u16 = 72;
pub const ELEM_NOT_EXP: u16 = 73;

// Injection payloads; carried by compiler-spec streams that share
// this scope.
pub const ELEM_PCODE: u16 = 74;
pub const ELEM_INPUT: u16 = 75;
pub const ELEM_OUTPUT: u16 = 76;
pub const ELEM_BODY: u16 = 77;

// Attributes.
pub const ATTRIB_VERSION: u16 = 1;
pub const ATTRIB_BIGENDIAN: u16 = 2;
pub const ATTRIB_ALIGN: u16 = 3;
pub const ATTRIB_UNIQBASE: u16 = 4;
pub const ATTRIB_MAXDELAY: u16 = 5;
pub const ATTRIB_UNIQMASK: u16 = 6;
pub const ATTRIB_NUMSECTIONS: u16 = 7;
pub const ATTRIB_DEFAULTSPACE: u16 = 8;
pub const ATTRIB_NAME: u16 = 9;
pub const ATTRIB_INDEX: u16 = 10;
pub const ATTRIB_DELAY: u16 = 11;
pub const ATTRIB_SIZE: u16 = 12;
pub const ATTRIB_WORDSIZE: u16 = 13;
pub const ATTRIB_PHYSICAL: u16 = 14;
pub const ATTRIB_SCOPE: u16 = 15;
pub const ATTRIB_ID: u16 = 16;
pub const ATTRIB_OFF: u16 = 17;
pub const ATTRIB_NONZERO: u16 = 18;
pub const ATTRIB_MASK: u16 = 19;
pub const ATTRIB_VAL: u16 = 20;
pub const ATTRIB_SPACE: u16 = 21;
pub const ATTRIB_OFFSET: u16 = 22;
pub const ATTRIB_LOW: u16 = 23;
pub const ATTRIB_HIGH: u16 = 24;
pub const ATTRIB_FLOW: u16 = 25;
pub const ATTRIB_PARENT: u16 = 26;
pub const ATTRIB_FIRST: u16 = 27;
pub const ATTRIB_LENGTH: u16 = 28;
pub const ATTRIB_SOURCE: u16 = 29;
pub const ATTRIB_LINE: u16 = 30;
pub const ATTRIB_NUMCT: u16 = 31;
pub const ATTRIB_CONTEXT: u16 = 32;
pub const ATTRIB_STARTBIT: u16 = 33;
pub const ATTRIB_NUMBER: u16 = 34;
pub const ATTRIB_PIECE: u16 = 35;
pub const ATTRIB_CODE: u16 = 36;
pub const ATTRIB_TYPE: u16 = 37;
pub const ATTRIB_LABELS: u16 = 38;
pub const ATTRIB_SECTION: u16 = 39;
pub const ATTRIB_DELAYSLOT: u16 = 40;
pub const ATTRIB_SIGNBIT: u16 = 41;
pub const ATTRIB_STARTBYTE: u16 = 42;
pub const ATTRIB_ENDBYTE: u16 = 43;
pub const ATTRIB_SHIFT: u16 = 44;
pub const ATTRIB_MINLEN: u16 = 45;
pub const ATTRIB_BASE: u16 = 46;
pub const ATTRIB_SUBSYM: u16 = 47;
pub const ATTRIB_VARNODE: u16 = 48;
pub const ATTRIB_LAST: u16 = 49;
pub const ATTRIB_PLUS: u16 = 50;
pub const ATTRIB_SELECT: u16 = 51;
pub const ATTRIB_ENDBIT: u16 = 52;
pub const ATTRIB_CT: u16 = 53;
