//! Element-centric register maps (`.svd`).
//!
//! Peripherals, registers, clusters and fields come from `svd-parser` with
//! array and `derivedFrom` expansion enabled. The parser has no model for
//! `<memory>` blocks, so those and the device name are read with roxmltree.
//!
//! Unlike the attribute schema there is no module/instance split and no
//! memory type, so:
//!
//! - every `<peripheral>` becomes one module with one instance and a single
//!   register group named [`REGISTER_GROUP`];
//! - a `<memory>` whose name mentions "flash" is flash, anything else is RAM.
//!
//! Register `<size>` is in bits here and is converted to bytes.

use std::collections::BTreeMap;
use std::path::Path;

use roxmltree::{Document, Node};
use svd_parser::svd::{
    Access as SvdAccess, DimElement, FieldInfo, MaybeArray, PeripheralInfo, RegisterCluster,
    RegisterInfo, RegisterProperties,
};
use tracing::debug;

use super::model::*;
use super::{DescriptorError, DescriptorParser, malformed, parse_number};
use crate::command::MemoryKind;

/// Name of the synthetic register group every peripheral is flattened into.
pub const REGISTER_GROUP: &str = "registers";

/// Largest `<dim>` accepted on any element.
pub const MAX_DIM: u64 = 1024;

const DEFAULT_REGISTER_BITS: u32 = 32;

/// Parser for the element schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct SvdParser;

impl DescriptorParser for SvdParser {
    fn extension(&self) -> &'static str {
        "svd"
    }

    fn parse_str(
        &self,
        text: &str,
        mcu_name: &str,
        path: &Path,
    ) -> Result<DeviceMetadata, DescriptorError> {
        let doc = Document::parse(text).map_err(|e| malformed(path, e.to_string()))?;
        let root = doc.root_element();
        if !root.has_tag_name("device") {
            return Err(malformed(
                path,
                format!("root element is <{}>, expected <device>", root.tag_name().name()),
            ));
        }

        let found = child_text(root, "name").unwrap_or_default();
        if !found.eq_ignore_ascii_case(mcu_name) {
            return Err(DescriptorError::DeviceMismatch {
                path: path.to_path_buf(),
                expected: mcu_name.to_string(),
                found: found.to_string(),
            });
        }

        let ctx = Ctx { path };
        let mut meta = DeviceMetadata {
            device_name: found.to_string(),
            ..Default::default()
        };

        for memory in root.descendants().filter(|n| n.has_tag_name("memory")) {
            let (name, segment) = ctx.memory(memory)?;
            meta.memories.insert(name, segment);
        }

        // Expansion allocates one element per array index.
        ctx.check_arrays(root)?;
        let config = svd_parser::Config::default().expand(true);
        let device = svd_parser::parse_with_config(text, &config)
            .map_err(|e| malformed(path, format!("{:#}", e)))?;

        for peripheral in &device.peripherals {
            let name = peripheral.name.clone();
            let caption = peripheral
                .description
                .as_deref()
                .or_else(|| base_description(&device.peripherals, peripheral))
                .map(normalize_ws)
                .unwrap_or_default();
            let base_address = peripheral.base_address;
            let props = inherit(
                &peripheral.default_register_properties,
                Props::from_defaults(&device.default_register_properties),
            );

            let mut registers = BTreeMap::new();
            for child in peripheral.registers.iter().flatten() {
                ctx.collect(child, 0, props, &mut registers)?;
            }
            for (reg_name, register) in &registers {
                if base_address.checked_add(register.offset).is_none() {
                    return Err(malformed(
                        path,
                        format!(
                            "{}.{} at offset 0x{:X} overflows base 0x{:X}",
                            name, reg_name, register.offset, base_address
                        ),
                    ));
                }
            }
            debug!(peripheral = %name, registers = registers.len(), "Parsed peripheral");

            for irq in &peripheral.interrupt {
                // First declaration wins when a derived peripheral repeats it.
                meta.interrupts
                    .entry(irq.name.clone())
                    .or_insert_with(|| Interrupt {
                        index: irq.value,
                        caption: irq.description.as_deref().map(normalize_ws).unwrap_or_default(),
                        owning_module_instance: Some(name.clone()),
                    });
            }

            let mut register_groups = BTreeMap::new();
            register_groups.insert(
                REGISTER_GROUP.to_string(),
                RegisterGroup {
                    name_in_module: REGISTER_GROUP.to_string(),
                    caption: caption.clone(),
                    offset: base_address,
                    registers,
                },
            );
            meta.modules.insert(
                name.clone(),
                Module {
                    caption: caption.clone(),
                    instances: vec![ModuleInstance {
                        name: name.clone(),
                        register_group_ref: Some(REGISTER_GROUP.to_string()),
                        offset: base_address,
                        address_space: None,
                    }],
                    register_groups,
                },
            );
            meta.peripherals.insert(
                name.clone(),
                Peripheral {
                    caption,
                    instances: vec![PeripheralInstance { name }],
                },
            );
        }

        Ok(meta)
    }
}

fn base_description<'a>(
    all: &'a [svd_parser::svd::Peripheral],
    peripheral: &PeripheralInfo,
) -> Option<&'a str> {
    let base = peripheral.derived_from.as_deref()?;
    all.iter()
        .find(|p| p.name == base)
        .and_then(|p| p.description.as_deref())
}

/// Register size and access inherited down the device → peripheral →
/// cluster → register chain.
#[derive(Debug, Clone, Copy)]
struct Props {
    size_bits: u32,
    access: Access,
}

impl Props {
    fn from_defaults(defaults: &RegisterProperties) -> Self {
        inherit(
            defaults,
            Props {
                size_bits: DEFAULT_REGISTER_BITS,
                access: Access::ReadWrite,
            },
        )
    }
}

fn inherit(own: &RegisterProperties, parent: Props) -> Props {
    Props {
        size_bits: own.size.unwrap_or(parent.size_bits),
        access: own.access.map(access).unwrap_or(parent.access),
    }
}

fn access(access: SvdAccess) -> Access {
    match access {
        SvdAccess::ReadOnly => Access::ReadOnly,
        SvdAccess::WriteOnly => Access::WriteOnly,
        SvdAccess::ReadWrite => Access::ReadWrite,
        SvdAccess::WriteOnce => Access::WriteOnce,
        SvdAccess::ReadWriteOnce => Access::ReadWriteOnce,
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(tag))
}

fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> Option<&'a str> {
    child(node, tag).and_then(|n| n.text()).map(str::trim)
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Like [`parse_number`], plus `#`-prefixed binary where `x` bits read as 0.
fn parse_svd_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix('#') {
        Some(bits) => u64::from_str_radix(&bits.replace(['x', 'X'], "0"), 2).ok(),
        None => parse_number(text),
    }
}

struct Ctx<'p> {
    path: &'p Path,
}

impl Ctx<'_> {
    fn number(&self, node: Node, tag: &str) -> Result<Option<u64>, DescriptorError> {
        match child_text(node, tag) {
            None => Ok(None),
            Some(text) => parse_svd_number(text).map(Some).ok_or_else(|| {
                malformed(
                    self.path,
                    format!("<{}>{}</{}> is not a number", tag, text, tag),
                )
            }),
        }
    }

    fn required_number(&self, node: Node, tag: &str) -> Result<u64, DescriptorError> {
        self.number(node, tag)?.ok_or_else(|| {
            malformed(
                self.path,
                format!(
                    "<{}> '{}' lacks <{}>",
                    node.tag_name().name(),
                    child_text(node, "name").unwrap_or("?"),
                    tag
                ),
            )
        })
    }

    fn memory(&self, node: Node) -> Result<(String, MemorySegment), DescriptorError> {
        let name = child_text(node, "name")
            .ok_or_else(|| malformed(self.path, "<memory> without <name>"))?
            .to_string();
        let kind = if name.to_ascii_lowercase().contains("flash") {
            MemoryKind::Flash
        } else {
            MemoryKind::Ram
        };
        let start = self.required_number(node, "start")?;
        let size = self.required_number(node, "size")?;
        if start.checked_add(size).is_none() {
            return Err(malformed(
                self.path,
                format!("memory {} at 0x{:X} overflows with size 0x{:X}", name, start, size),
            ));
        }
        let segment = MemorySegment {
            start,
            size,
            kind,
            page_size: self.number(node, "pageSize")?,
        };
        Ok((name, segment))
    }

    /// Rejects arrays longer than [`MAX_DIM`] or whose last element lands
    /// past the 32-bit offset space.
    fn check_arrays(&self, root: Node) -> Result<(), DescriptorError> {
        for node in root.descendants().filter(|n| n.is_element()) {
            let Some(dim) = self.number(node, "dim")? else {
                continue;
            };
            let name = child_text(node, "name").unwrap_or("?");
            if dim == 0 || dim > MAX_DIM {
                return Err(malformed(
                    self.path,
                    format!("{} has dim {}, expected 1..={}", name, dim, MAX_DIM),
                ));
            }
            let increment = self.number(node, "dimIncrement")?.unwrap_or(0);
            let start = self.number(node, "addressOffset")?.unwrap_or(0);
            let last = (dim - 1)
                .checked_mul(increment)
                .and_then(|span| span.checked_add(start))
                .filter(|last| *last <= u64::from(u32::MAX));
            if last.is_none() {
                return Err(malformed(
                    self.path,
                    format!(
                        "{} array of {} with increment 0x{:X} overflows",
                        name, dim, increment
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Flatten a register or cluster (and its children) into `out`.
    fn collect(
        &self,
        item: &RegisterCluster,
        base_offset: u64,
        props: Props,
        out: &mut BTreeMap<String, Register>,
    ) -> Result<(), DescriptorError> {
        match item {
            RegisterCluster::Register(register) => {
                let info: &RegisterInfo = register;
                let props = inherit(&info.properties, props);
                let offset = self.offset(base_offset, info.address_offset, &info.name)?;
                let template = self.register(info, offset, props)?;
                for (name, step) in self.instances(&info.name, dim_of(register))? {
                    let mut register = template.clone();
                    register.offset = self.offset(offset, step, &name)?;
                    out.insert(name, register);
                }
            }
            RegisterCluster::Cluster(cluster) => {
                let props = inherit(&cluster.default_register_properties, props);
                let offset = self.offset(base_offset, cluster.address_offset, &cluster.name)?;
                for (name, step) in self.instances(&cluster.name, dim_of(cluster))? {
                    let cluster_offset = self.offset(offset, step, &name)?;
                    for child in &cluster.children {
                        self.collect(child, cluster_offset, props, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn offset(&self, base: u64, add: impl Into<u64>, name: &str) -> Result<u64, DescriptorError> {
        let add = add.into();
        base.checked_add(add).ok_or_else(|| {
            malformed(
                self.path,
                format!("{} offset 0x{:X} + 0x{:X} overflows", name, base, add),
            )
        })
    }

    /// Names and extra offsets of an element, one pair per array index.
    fn instances(
        &self,
        name: &str,
        dim: Option<&DimElement>,
    ) -> Result<Vec<(String, u64)>, DescriptorError> {
        let Some(dim) = dim else {
            return Ok(vec![(name.to_string(), 0)]);
        };
        let count = u64::from(dim.dim);
        if count > MAX_DIM {
            return Err(malformed(
                self.path,
                format!("{} has dim {}, expected at most {}", name, count, MAX_DIM),
            ));
        }
        let indices: Vec<String> = match &dim.dim_index {
            Some(list) => list.clone(),
            None => (0..count).map(|i| i.to_string()).collect(),
        };
        indices
            .iter()
            .take(count as usize)
            .enumerate()
            .map(|(i, index)| {
                let step = (i as u64)
                    .checked_mul(u64::from(dim.dim_increment))
                    .ok_or_else(|| malformed(self.path, format!("{} array overflows", name)))?;
                Ok((name.replace("[%s]", index).replace("%s", index), step))
            })
            .collect()
    }

    fn register(
        &self,
        info: &RegisterInfo,
        offset: u64,
        props: Props,
    ) -> Result<Register, DescriptorError> {
        let mut bitfields = BTreeMap::new();
        for field in info.fields.iter().flatten() {
            let template = self.field(field)?;
            for (name, step) in self.instances(&field.name, dim_of(field))? {
                let shift = u32::try_from(step)
                    .map_err(|_| malformed(self.path, format!("field {} out of range", name)))?;
                let mut bitfield = template.clone();
                bitfield.mask = shifted(bitfield.mask, shift)
                    .ok_or_else(|| malformed(self.path, format!("field {} out of range", name)))?;
                bitfields.insert(name, bitfield);
            }
        }

        Ok(Register {
            caption: info.description.as_deref().map(normalize_ws).unwrap_or_default(),
            offset,
            size: u64::from(props.size_bits).div_ceil(8),
            mask: Some(width_mask(props.size_bits)),
            access: props.access,
            bitfields,
        })
    }

    fn field(&self, info: &FieldInfo) -> Result<Bitfield, DescriptorError> {
        let range = &info.bit_range;
        let mask = shifted(width_mask(range.width), range.offset).ok_or_else(|| {
            malformed(
                self.path,
                format!(
                    "field {} bits {}..+{} do not fit a 64-bit register",
                    info.name, range.offset, range.width
                ),
            )
        })?;

        let mut enumerated_values = BTreeMap::new();
        for value in info.enumerated_values.iter().flat_map(|group| &group.values) {
            // `isDefault` entries carry no value.
            let Some(number) = value.value else {
                continue;
            };
            enumerated_values.insert(
                value.name.clone(),
                EnumeratedValue {
                    caption: value.description.as_deref().map(normalize_ws).unwrap_or_default(),
                    value: number,
                },
            );
        }

        Ok(Bitfield {
            caption: info.description.as_deref().map(normalize_ws).unwrap_or_default(),
            mask,
            enumerated_values,
        })
    }
}

fn dim_of<T>(item: &MaybeArray<T>) -> Option<&DimElement> {
    match item {
        MaybeArray::Single(_) => None,
        MaybeArray::Array(_, dim) => Some(dim),
    }
}

/// `mask << shift`, or `None` when set bits would fall off the top.
fn shifted(mask: u64, shift: u32) -> Option<u64> {
    if mask == 0 {
        return Some(0);
    }
    let moved = mask.checked_shl(shift)?;
    (moved >> shift == mask).then_some(moved)
}

fn width_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}
