//! A small ABC assembler for building test inputs.
//!
//! Only public names are supported; every type annotation is `*`.

#![allow(dead_code)]

use abcopt::abc::constants::*;
use abcopt::abc::Writer;

pub enum Trait {
    Method(u32, u32),
    Getter(u32, u32),
    Class(u32, u32),
    Slot(u32),
}

#[derive(Default)]
pub struct Asm {
    strings: Vec<String>,
    names: Vec<String>,
    methods: Vec<(usize, u8)>,
    instances: Vec<(u32, u32, u32, Vec<Trait>)>,
    classes: Vec<(u32, Vec<Trait>)>,
    scripts: Vec<(u32, Vec<Trait>)>,
    bodies: Vec<(u32, u32, u32, Vec<u8>)>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    fn string(&mut self, s: &str) -> u32 {
        match self.strings.iter().position(|x| x == s) {
            Some(i) => i as u32 + 1,
            None => {
                self.strings.push(s.to_string());
                self.strings.len() as u32
            }
        }
    }

    /// Public qualified name `local`.
    pub fn name(&mut self, local: &str) -> u32 {
        self.string(local);
        match self.names.iter().position(|x| x == local) {
            Some(i) => i as u32 + 1,
            None => {
                self.names.push(local.to_string());
                self.names.len() as u32
            }
        }
    }

    /// A method signature with `params` untyped parameters.
    pub fn method(&mut self, params: usize, flags: u8) -> u32 {
        self.methods.push((params, flags));
        self.methods.len() as u32 - 1
    }

    pub fn body(&mut self, method: u32, max_stack: u32, locals: u32, code: &[u8]) {
        self.bodies.push((method, max_stack, locals, code.to_vec()));
    }

    /// Function `params -> *` with `code` as its body.
    pub fn function(&mut self, params: usize, max_stack: u32, code: &[u8]) -> u32 {
        let m = self.method(params, 0);
        self.body(m, max_stack, params as u32 + 1, code);
        m
    }

    /// A sealed class; returns its class index.
    pub fn class(&mut self, name: u32, base: u32, iinit: u32, cinit: u32) -> u32 {
        self.instances.push((name, base, iinit, Vec::new()));
        self.classes.push((cinit, Vec::new()));
        self.classes.len() as u32 - 1
    }

    pub fn script(&mut self, init: u32, traits: Vec<Trait>) {
        self.scripts.push((init, traits));
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.string("");
        let mut w = Writer::new();
        w.write_u16(MINOR_VERSION);
        w.write_u16(MAJOR_VERSION);
        w.write_u30(0); // ints
        w.write_u30(0); // uints
        w.write_u30(0); // doubles
        w.write_u30(self.strings.len() as u32 + 1);
        for s in &self.strings {
            w.write_string(s);
        }
        let empty = self.strings.iter().position(|s| s.is_empty()).unwrap_or(0) as u32 + 1;
        w.write_u30(2);
        w.write_u8(CONSTANT_PACKAGE_NS);
        w.write_u30(empty);
        w.write_u30(0); // namespace sets
        w.write_u30(self.names.len() as u32 + 1);
        for n in &self.names {
            let s = self.strings.iter().position(|x| x == n).unwrap() as u32 + 1;
            w.write_u8(CONSTANT_QNAME);
            w.write_u30(1);
            w.write_u30(s);
        }

        w.write_index(self.methods.len());
        for &(params, flags) in &self.methods {
            w.write_index(params);
            w.write_u30(0);
            for _ in 0..params {
                w.write_u30(0);
            }
            w.write_u30(0);
            w.write_u8(flags);
        }
        w.write_u30(0); // metadata

        w.write_index(self.instances.len());
        for (name, base, iinit, traits) in &self.instances {
            w.write_u30(*name);
            w.write_u30(*base);
            w.write_u8(CLASS_SEALED);
            w.write_u30(0);
            w.write_u30(*iinit);
            write_traits(&mut w, traits);
        }
        for (cinit, traits) in &self.classes {
            w.write_u30(*cinit);
            write_traits(&mut w, traits);
        }
        w.write_index(self.scripts.len());
        for (init, traits) in &self.scripts {
            w.write_u30(*init);
            write_traits(&mut w, traits);
        }

        w.write_index(self.bodies.len());
        for (m, max_stack, locals, code) in &self.bodies {
            w.write_u30(*m);
            w.write_u30(*max_stack);
            w.write_u30(*locals);
            w.write_u30(0);
            w.write_u30(1);
            w.write_index(code.len());
            w.write_bytes(code);
            w.write_u30(0); // exceptions
            w.write_u30(0); // traits
        }
        w.into_bytes()
    }
}

fn write_traits(w: &mut Writer, traits: &[Trait]) {
    w.write_index(traits.len());
    for t in traits {
        match *t {
            Trait::Method(name, m) | Trait::Getter(name, m) => {
                w.write_u30(name);
                w.write_u8(if matches!(t, Trait::Getter(..)) {
                    TRAIT_GETTER
                } else {
                    TRAIT_METHOD
                });
                w.write_u30(0);
                w.write_u30(m);
            }
            Trait::Class(name, c) => {
                w.write_u30(name);
                w.write_u8(TRAIT_CLASS);
                w.write_u30(0);
                w.write_u30(c);
            }
            Trait::Slot(name) => {
                w.write_u30(name);
                w.write_u8(TRAIT_SLOT);
                w.write_u30(0);
                w.write_u30(0);
                w.write_u30(0);
            }
        }
    }
}

/// `returnvoid`
pub const RETURN_VOID: &[u8] = &[0x47];
