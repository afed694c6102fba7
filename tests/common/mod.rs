//! Builds minimal class files byte-by-byte for pipeline tests.

use std::collections::HashMap;

/// Incremental class-file builder. Pool entries are interned so repeated
/// references share indices, the way javac emits them.
pub struct ClassFileBuilder {
    entries: Vec<Vec<u8>>,
    utf8_cache: HashMap<String, u16>,
    ref_cache: HashMap<(u8, u16, u16), u16>,
    methods: Vec<Vec<u8>>,
    this_class: u16,
    super_class: u16,
}

impl ClassFileBuilder {
    pub fn new(class_name: &str) -> Self {
        let mut builder = Self {
            entries: Vec::new(),
            utf8_cache: HashMap::new(),
            ref_cache: HashMap::new(),
            methods: Vec::new(),
            this_class: 0,
            super_class: 0,
        };
        builder.this_class = builder.class(class_name);
        builder.super_class = builder.class("java/lang/Object");
        builder
    }

    fn add(&mut self, bytes: Vec<u8>) -> u16 {
        self.entries.push(bytes);
        self.entries.len() as u16
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        if let Some(&index) = self.utf8_cache.get(text) {
            return index;
        }
        let mut bytes = vec![1];
        bytes.extend((text.len() as u16).to_be_bytes());
        bytes.extend(text.as_bytes());
        let index = self.add(bytes);
        self.utf8_cache.insert(text.to_string(), index);
        index
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.composite(7, name_index, 0)
    }

    pub fn name_and_type(&mut self, name: &str, desc: &str) -> u16 {
        let name_index = self.utf8(name);
        let desc_index = self.utf8(desc);
        self.composite(12, name_index, desc_index)
    }

    fn composite(&mut self, tag: u8, a: u16, b: u16) -> u16 {
        if let Some(&index) = self.ref_cache.get(&(tag, a, b)) {
            return index;
        }
        let mut bytes = vec![tag];
        bytes.extend(a.to_be_bytes());
        if tag != 7 {
            bytes.extend(b.to_be_bytes());
        }
        let index = self.add(bytes);
        self.ref_cache.insert((tag, a, b), index);
        index
    }

    /// `System.out`, the operand of `getstatic`.
    pub fn out_field(&mut self) -> u16 {
        let system = self.class("java/lang/System");
        let nat = self.name_and_type("out", "Ljava/io/PrintStream;");
        self.composite(9, system, nat)
    }

    /// A `PrintStream.print`/`println` method reference.
    pub fn print_method(&mut self, name: &str, desc: &str) -> u16 {
        let stream = self.class("java/io/PrintStream");
        let nat = self.name_and_type(name, desc);
        self.composite(10, stream, nat)
    }

    /// A static method of this class, for `invokestatic`.
    pub fn self_method(&mut self, name: &str, desc: &str) -> u16 {
        let this = self.this_class;
        let nat = self.name_and_type(name, desc);
        self.composite(10, this, nat)
    }

    /// Declare a method with the given `Code` attribute body.
    pub fn method(&mut self, name: &str, desc: &str, max_stack: u16, max_locals: u16, code: &[u8]) {
        let name_index = self.utf8(name);
        let desc_index = self.utf8(desc);
        let code_attr_name = self.utf8("Code");

        let mut bytes = Vec::new();
        bytes.extend(0x0009u16.to_be_bytes()); // public static
        bytes.extend(name_index.to_be_bytes());
        bytes.extend(desc_index.to_be_bytes());
        bytes.extend(1u16.to_be_bytes()); // one attribute

        bytes.extend(code_attr_name.to_be_bytes());
        bytes.extend((12 + code.len() as u32).to_be_bytes());
        bytes.extend(max_stack.to_be_bytes());
        bytes.extend(max_locals.to_be_bytes());
        bytes.extend((code.len() as u32).to_be_bytes());
        bytes.extend(code);
        bytes.extend(0u16.to_be_bytes()); // exception table
        bytes.extend(0u16.to_be_bytes()); // code attributes

        self.methods.push(bytes);
    }

    /// The `<init>` constructor javac always emits. Its body uses opcodes
    /// outside the compiled subset; the compiler must skip it by name.
    pub fn default_constructor(&mut self) {
        let object_init = {
            let object = self.class("java/lang/Object");
            let nat = self.name_and_type("<init>", "()V");
            self.composite(10, object, nat)
        };
        let [hi, lo] = object_init.to_be_bytes();
        let code = [
            0x2a, // aload_0
            0xb7, hi, lo, // invokespecial Object.<init>
            0xb1, // return
        ];

        let name_index = self.utf8("<init>");
        let desc_index = self.utf8("()V");
        let code_attr_name = self.utf8("Code");

        let mut bytes = Vec::new();
        bytes.extend(0x0001u16.to_be_bytes()); // public
        bytes.extend(name_index.to_be_bytes());
        bytes.extend(desc_index.to_be_bytes());
        bytes.extend(1u16.to_be_bytes());
        bytes.extend(code_attr_name.to_be_bytes());
        bytes.extend((12 + code.len() as u32).to_be_bytes());
        bytes.extend(1u16.to_be_bytes()); // max_stack
        bytes.extend(1u16.to_be_bytes()); // max_locals
        bytes.extend((code.len() as u32).to_be_bytes());
        bytes.extend(code);
        bytes.extend(0u16.to_be_bytes());
        bytes.extend(0u16.to_be_bytes());
        self.methods.push(bytes);
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(0xCAFEBABEu32.to_be_bytes());
        out.extend(0u16.to_be_bytes()); // minor
        out.extend(52u16.to_be_bytes()); // major (Java 8)

        out.extend((self.entries.len() as u16 + 1).to_be_bytes());
        for entry in &self.entries {
            out.extend(entry);
        }

        out.extend(0x0021u16.to_be_bytes()); // public super
        out.extend(self.this_class.to_be_bytes());
        out.extend(self.super_class.to_be_bytes());
        out.extend(0u16.to_be_bytes()); // interfaces
        out.extend(0u16.to_be_bytes()); // fields

        out.extend((self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            out.extend(method);
        }

        out.extend(0u16.to_be_bytes()); // class attributes
        out
    }
}

/// Split a pool index into bytecode operand bytes.
pub fn idx(index: u16) -> [u8; 2] {
    index.to_be_bytes()
}
