// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Caller template emission
//!
//! Emits the code blob every synthesized caller is defined from. The blob is
//! a structural description of one type implementing the caller contract:
//!
//! - `<init>()V` only delegates to the supertype constructor
//! - `call(target, cx, this, args)` loads its four arguments verbatim, invokes
//!   `call(cx, this, args)` on the target and returns the result
//!
//! Nothing domain or context specific is encoded. Attribution comes from the
//! loader the blob is defined through.
//!
//! Wire format: 4-byte magic, big-endian `u16` format version, bincode body.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements the template collaborator of the loader

use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::domain::access::AccessController;
use crate::domain::error::SynthesisError;

pub const CALLER_CONTRACT_VERSION: u16 = 1;
pub const CALLER_SUPERTYPE: &str = "boundary/Caller";
pub const CALLABLE_TYPE: &str = "boundary/Callable";
pub const CONSTRUCTOR_NAME: &str = "<init>";
pub const CONSTRUCTOR_SIGNATURE: &str = "()V";
pub const CALL_METHOD_NAME: &str = "call";
/// `call` on the caller: target, context, this, args.
pub const CALL_SIGNATURE: &str =
    "(Lboundary/Callable;Lboundary/CallContext;Lboundary/Value;[Lboundary/Value;)Lboundary/Value;";
/// `call` on the target: context, this, args.
pub const TARGET_CALL_SIGNATURE: &str =
    "(Lboundary/CallContext;Lboundary/Value;[Lboundary/Value;)Lboundary/Value;";
/// Arguments of the target's `call`, not counting the receiver.
pub const TARGET_ARITY: u8 = 3;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_FINAL: u16 = 0x0010;

const BLOB_MAGIC: [u8; 4] = *b"TBCT";
const BLOB_FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Push local slot `n`. Slot 0 is the instance, then the method arguments.
    LoadLocal(u16),
    InvokeSuper { name: String, signature: String },
    /// Invoke `name` on a receiver of `interface`. Pops `arity` arguments and
    /// the receiver, pushes the result.
    InvokeInterface {
        interface: String,
        name: String,
        signature: String,
        arity: u8,
    },
    Return,
    ReturnValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub signature: String,
    pub flags: u16,
    pub max_locals: u16,
    pub code: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub contract_version: u16,
    pub name: String,
    pub supertype: String,
    pub source_file: String,
    pub methods: Vec<MethodDescriptor>,
}

impl TypeDescriptor {
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// An immutable, encoded type description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlob(Arc<[u8]>);

impl CodeBlob {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Builds a [`TypeDescriptor`] one method at a time.
struct TemplateWriter {
    descriptor: TypeDescriptor,
    current: Option<MethodDescriptor>,
}

impl TemplateWriter {
    fn new(name: &str, supertype: &str, source_file: &str) -> Self {
        Self {
            descriptor: TypeDescriptor {
                contract_version: CALLER_CONTRACT_VERSION,
                name: name.to_string(),
                supertype: supertype.to_string(),
                source_file: source_file.to_string(),
                methods: Vec::new(),
            },
            current: None,
        }
    }

    fn start_method(&mut self, name: &str, signature: &str, flags: u16) {
        self.current = Some(MethodDescriptor {
            name: name.to_string(),
            signature: signature.to_string(),
            flags,
            max_locals: 0,
            code: Vec::new(),
        });
    }

    fn add(&mut self, instruction: Instruction) -> Result<(), SynthesisError> {
        self.current
            .as_mut()
            .ok_or_else(|| {
                SynthesisError::MalformedTemplate("instruction outside of a method".to_string())
            })?
            .code
            .push(instruction);
        Ok(())
    }

    fn stop_method(&mut self, max_locals: u16) -> Result<(), SynthesisError> {
        let mut method = self
            .current
            .take()
            .ok_or_else(|| SynthesisError::MalformedTemplate("no method to stop".to_string()))?;
        method.max_locals = max_locals;
        self.descriptor.methods.push(method);
        Ok(())
    }

    fn finish(self) -> Result<TypeDescriptor, SynthesisError> {
        if let Some(method) = self.current {
            return Err(SynthesisError::MalformedTemplate(format!(
                "method '{}' was never stopped",
                method.name
            )));
        }
        Ok(self.descriptor)
    }
}

fn caller_descriptor() -> Result<TypeDescriptor, SynthesisError> {
    let mut writer = TemplateWriter::new(
        &format!("{CALLER_SUPERTYPE}Impl"),
        CALLER_SUPERTYPE,
        "<generated>",
    );

    writer.start_method(CONSTRUCTOR_NAME, CONSTRUCTOR_SIGNATURE, ACC_PUBLIC);
    writer.add(Instruction::LoadLocal(0))?;
    writer.add(Instruction::InvokeSuper {
        name: CONSTRUCTOR_NAME.to_string(),
        signature: CONSTRUCTOR_SIGNATURE.to_string(),
    })?;
    writer.add(Instruction::Return)?;
    writer.stop_method(1)?;

    writer.start_method(CALL_METHOD_NAME, CALL_SIGNATURE, ACC_PUBLIC | ACC_FINAL);
    for slot in 1..=u16::from(TARGET_ARITY) + 1 {
        writer.add(Instruction::LoadLocal(slot))?;
    }
    writer.add(Instruction::InvokeInterface {
        interface: CALLABLE_TYPE.to_string(),
        name: CALL_METHOD_NAME.to_string(),
        signature: TARGET_CALL_SIGNATURE.to_string(),
        arity: TARGET_ARITY,
    })?;
    writer.add(Instruction::ReturnValue)?;
    writer.stop_method(u16::from(TARGET_ARITY) + 2)?;

    writer.finish()
}

pub fn encode(descriptor: &TypeDescriptor) -> Result<CodeBlob, SynthesisError> {
    let body = bincode::serialize(descriptor)
        .map_err(|e| SynthesisError::MalformedTemplate(format!("encoding failed: {e}")))?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(&BLOB_MAGIC);
    bytes.extend_from_slice(&BLOB_FORMAT_VERSION.to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(CodeBlob::from_bytes(bytes))
}

pub fn decode(blob: &CodeBlob) -> Result<TypeDescriptor, SynthesisError> {
    let bytes = blob.as_bytes();
    if bytes.len() < HEADER_LEN || bytes[..4] != BLOB_MAGIC {
        return Err(SynthesisError::MalformedTemplate("missing blob header".to_string()));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != BLOB_FORMAT_VERSION {
        return Err(SynthesisError::MalformedTemplate(format!(
            "unsupported blob format version {version}"
        )));
    }
    bincode::deserialize(&bytes[HEADER_LEN..])
        .map_err(|e| SynthesisError::MalformedTemplate(format!("decoding failed: {e}")))
}

/// Check `descriptor` against the caller contract.
///
/// Beyond the fixed constructor and `call` shapes, the `call` body must
/// forward its arguments verbatim: it loads slots `1..=arity + 1` in order,
/// invokes the target once and returns its value.
pub fn verify(descriptor: &TypeDescriptor) -> Result<(), SynthesisError> {
    let malformed = |reason: String| SynthesisError::MalformedTemplate(reason);

    if descriptor.contract_version != CALLER_CONTRACT_VERSION {
        return Err(malformed(format!(
            "contract version {} does not match {}",
            descriptor.contract_version, CALLER_CONTRACT_VERSION
        )));
    }
    if descriptor.supertype != CALLER_SUPERTYPE {
        return Err(malformed(format!("unexpected supertype '{}'", descriptor.supertype)));
    }
    if descriptor.methods.len() != 2 {
        return Err(malformed(format!(
            "expected 2 methods, found {}",
            descriptor.methods.len()
        )));
    }

    let constructor = descriptor
        .method(CONSTRUCTOR_NAME)
        .ok_or_else(|| malformed("missing constructor".to_string()))?;
    let expected_constructor = [
        Instruction::LoadLocal(0),
        Instruction::InvokeSuper {
            name: CONSTRUCTOR_NAME.to_string(),
            signature: CONSTRUCTOR_SIGNATURE.to_string(),
        },
        Instruction::Return,
    ];
    if constructor.signature != CONSTRUCTOR_SIGNATURE || constructor.code != expected_constructor {
        return Err(malformed("constructor must only delegate to its supertype".to_string()));
    }

    let call = descriptor
        .method(CALL_METHOD_NAME)
        .ok_or_else(|| malformed("missing call method".to_string()))?;
    if call.signature != CALL_SIGNATURE {
        return Err(malformed(format!(
            "call signature '{}' does not match contract",
            call.signature
        )));
    }
    if call.flags & ACC_PUBLIC == 0 {
        return Err(malformed("call must be public".to_string()));
    }
    verify_forwarding(call)
}

fn verify_forwarding(call: &MethodDescriptor) -> Result<(), SynthesisError> {
    let malformed = |reason: String| SynthesisError::MalformedTemplate(reason);
    let (last, body) = call
        .code
        .split_last()
        .ok_or_else(|| malformed("call has no code".to_string()))?;
    if *last != Instruction::ReturnValue {
        return Err(malformed("call must end by returning a value".to_string()));
    }
    let (invoke, loads) = body
        .split_last()
        .ok_or_else(|| malformed("call never invokes its target".to_string()))?;

    let arity = match invoke {
        Instruction::InvokeInterface {
            interface,
            name,
            signature,
            arity,
        } if interface == CALLABLE_TYPE
            && name == CALL_METHOD_NAME
            && signature == TARGET_CALL_SIGNATURE =>
        {
            *arity
        }
        other => return Err(malformed(format!("unexpected target invocation {other:?}"))),
    };

    let expected: Vec<Instruction> = (1..=u16::from(arity) + 1)
        .map(Instruction::LoadLocal)
        .collect();
    if loads != expected.as_slice() {
        return Err(malformed("call must load its arguments verbatim and in order".to_string()));
    }
    if call.max_locals < u16::from(arity) + 2 {
        return Err(malformed(format!(
            "max_locals {} too small for {} arguments",
            call.max_locals,
            u16::from(arity) + 1
        )));
    }
    Ok(())
}

/// Emit and encode the caller template. Pure and deterministic.
pub fn synthesize_template() -> Result<CodeBlob, SynthesisError> {
    let descriptor = caller_descriptor()?;
    verify(&descriptor)?;
    encode(&descriptor)
}

static CALLER_TEMPLATE: OnceLock<CodeBlob> = OnceLock::new();

/// The process-wide caller template, emitted on first use.
///
/// # Panics
///
/// If the template does not satisfy the caller contract. That is a defect in
/// this module, not a runtime condition.
pub fn caller_template() -> &'static CodeBlob {
    CALLER_TEMPLATE.get_or_init(|| {
        AccessController::with_system_privilege("emit caller template", || {
            match synthesize_template() {
                Ok(blob) => {
                    debug!(bytes = blob.len(), "Emitted caller template");
                    blob
                }
                Err(e) => panic!("caller template violates the caller contract: {e}"),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_is_deterministic_and_cached() {
        let first = synthesize_template().unwrap();
        let second = synthesize_template().unwrap();
        assert_eq!(first, second);
        assert!(std::ptr::eq(caller_template(), caller_template()));
        assert_eq!(caller_template().as_bytes(), first.as_bytes());
    }

    #[test]
    fn test_template_decodes_to_contract_shape() {
        let descriptor = decode(caller_template()).unwrap();
        assert_eq!(descriptor.name, "boundary/CallerImpl");
        assert_eq!(descriptor.supertype, CALLER_SUPERTYPE);

        let call = descriptor.method(CALL_METHOD_NAME).unwrap();
        assert_eq!(call.flags, ACC_PUBLIC | ACC_FINAL);
        assert_eq!(call.max_locals, 5);
        assert_eq!(call.code.len(), 6);
        assert!(verify(&descriptor).is_ok());
    }

    #[test]
    fn test_rejects_corrupted_blobs() {
        assert!(decode(&CodeBlob::from_bytes(vec![1, 2, 3])).is_err());

        let mut bytes = caller_template().as_bytes().to_vec();
        bytes[5] = 9;
        assert!(matches!(
            decode(&CodeBlob::from_bytes(bytes)),
            Err(SynthesisError::MalformedTemplate(_))
        ));

        let mut bytes = caller_template().as_bytes().to_vec();
        bytes.truncate(HEADER_LEN + 3);
        assert!(decode(&CodeBlob::from_bytes(bytes)).is_err());
    }

    #[test]
    fn test_verify_rejects_non_forwarding_call() {
        let mut descriptor = caller_descriptor().unwrap();
        let call = descriptor
            .methods
            .iter_mut()
            .find(|m| m.name == CALL_METHOD_NAME)
            .unwrap();
        call.code.swap(1, 2);
        assert!(verify(&descriptor).is_err());
    }

    #[test]
    fn test_verify_rejects_constructor_with_side_effects() {
        let mut descriptor = caller_descriptor().unwrap();
        let constructor = descriptor
            .methods
            .iter_mut()
            .find(|m| m.name == CONSTRUCTOR_NAME)
            .unwrap();
        constructor.code.insert(2, Instruction::LoadLocal(0));
        assert!(verify(&descriptor).is_err());
    }

    #[test]
    fn test_verify_rejects_other_contract_versions() {
        let mut descriptor = caller_descriptor().unwrap();
        descriptor.contract_version += 1;
        assert!(verify(&descriptor).is_err());
    }
}
