//! Attribute-centric chip descriptions (`.atdf`).
//!
//! Layout of the relevant parts:
//!
//! ```text
//! avr-tools-device-file
//! ├── devices/device[@name]
//! │   ├── address-spaces/address-space/memory-segment
//! │   ├── peripherals/module/instance/register-group
//! │   └── interrupts/interrupt
//! └── modules/module
//!     ├── register-group/register/bitfield
//!     └── value-group/value
//! ```
//!
//! A module-level register group shared by several instances is placed once
//! per instance, under the instance's register-group name.

use std::collections::BTreeMap;
use std::path::Path;

use roxmltree::{Document, Node};
use tracing::debug;

use super::model::*;
use super::{DescriptorError, DescriptorParser, malformed, parse_number};
use crate::command::MemoryKind;

/// Parser for the attribute schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct AtdfParser;

impl DescriptorParser for AtdfParser {
    fn extension(&self) -> &'static str {
        "atdf"
    }

    fn parse_str(
        &self,
        text: &str,
        mcu_name: &str,
        path: &Path,
    ) -> Result<DeviceMetadata, DescriptorError> {
        let doc = Document::parse(text).map_err(|e| malformed(path, e.to_string()))?;
        let root = doc.root_element();

        let device = root
            .descendants()
            .find(|n| n.has_tag_name("device"))
            .ok_or_else(|| malformed(path, "missing <device> element"))?;
        let found = device.attribute("name").unwrap_or_default();
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

        for segment in device
            .descendants()
            .filter(|n| n.has_tag_name("memory-segment"))
        {
            if let Some((name, seg)) = ctx.memory_segment(segment)? {
                meta.memories.insert(name, seg);
            }
        }

        let device_peripherals = elements(device, "peripherals").next();
        if let Some(peripherals) = device_peripherals {
            for module in elements(peripherals, "module") {
                let name = attr(module, "name");
                let instances = elements(module, "instance")
                    .map(|inst| PeripheralInstance {
                        name: attr(inst, "name"),
                    })
                    .collect();
                meta.peripherals.insert(
                    name,
                    Peripheral {
                        caption: attr(module, "caption"),
                        instances,
                    },
                );
            }
        }

        if let Some(modules) = elements(root, "modules").next() {
            for module in elements(modules, "module") {
                let name = attr(module, "name");
                let instanced_in_device = device_peripherals.and_then(|p| {
                    elements(p, "module").find(|m| m.attribute("name") == Some(name.as_str()))
                });
                let parsed = ctx.module(module, instanced_in_device)?;
                meta.modules.insert(name, parsed);
            }
        }

        if let Some(interrupts) = elements(device, "interrupts").next() {
            for irq in interrupts
                .descendants()
                .filter(|n| n.has_tag_name("interrupt"))
            {
                let index = ctx.required_number(irq, "index")?;
                let index = u32::try_from(index)
                    .map_err(|_| malformed(path, format!("interrupt index {} too large", index)))?;
                let owner = irq
                    .attribute("module-instance")
                    .map(str::to_string)
                    .filter(|s| !s.is_empty());
                meta.interrupts.insert(
                    attr(irq, "name"),
                    Interrupt {
                        index,
                        caption: attr(irq, "caption"),
                        owning_module_instance: owner,
                    },
                );
            }
        }

        Ok(meta)
    }
}

/// Child elements with the given tag.
fn elements<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    tag: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(move |n| n.has_tag_name(tag))
}

fn attr(node: Node, name: &str) -> String {
    node.attribute(name).unwrap_or_default().to_string()
}

struct Ctx<'p> {
    path: &'p Path,
}

impl Ctx<'_> {
    fn number(&self, node: Node, name: &str) -> Result<Option<u64>, DescriptorError> {
        match node.attribute(name) {
            None => Ok(None),
            Some(text) => parse_number(text).map(Some).ok_or_else(|| {
                malformed(
                    self.path,
                    format!(
                        "<{} {}=\"{}\"> is not a number",
                        node.tag_name().name(),
                        name,
                        text
                    ),
                )
            }),
        }
    }

    fn required_number(&self, node: Node, name: &str) -> Result<u64, DescriptorError> {
        self.number(node, name)?.ok_or_else(|| {
            malformed(
                self.path,
                format!(
                    "<{} name=\"{}\"> lacks '{}'",
                    node.tag_name().name(),
                    attr(node, "name"),
                    name
                ),
            )
        })
    }

    fn memory_segment(
        &self,
        node: Node,
    ) -> Result<Option<(String, MemorySegment)>, DescriptorError> {
        let type_name = attr(node, "type");
        let Ok(kind) = type_name.parse::<MemoryKind>() else {
            debug!(segment = %attr(node, "name"), kind = %type_name, "Skipping memory segment");
            return Ok(None);
        };
        let start = self.required_number(node, "start")?;
        let size = self.required_number(node, "size")?;
        let name = match node.attribute("name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}@0x{:X}", kind, start),
        };
        Ok(Some((
            name,
            MemorySegment {
                start,
                size,
                kind,
                page_size: self.number(node, "pagesize")?,
            },
        )))
    }

    fn module<'a, 'input>(
        &self,
        node: Node<'a, 'input>,
        device_module: Option<Node<'a, 'input>>,
    ) -> Result<Module, DescriptorError> {
        let mut module = Module {
            caption: attr(node, "caption"),
            ..Default::default()
        };

        let instance_nodes = node
            .descendants()
            .filter(|n| n.has_tag_name("instance"))
            .chain(device_module.into_iter().flat_map(|m| elements(m, "instance")));
        // (instance register-group name, instance) for every placed group.
        let mut placements: Vec<(String, ModuleInstance)> = Vec::new();
        for inst in instance_nodes {
            let parsed = self.instance(inst)?;
            if module.instances.iter().any(|i| i.name == parsed.name) {
                continue;
            }
            if let Some(key) = elements(inst, "register-group")
                .next()
                .and_then(|g| g.attribute("name"))
            {
                placements.push((key.to_string(), parsed.clone()));
            }
            module.instances.push(parsed);
        }

        let value_groups = self.value_groups(node)?;

        for group in elements(node, "register-group") {
            let name = attr(group, "name");
            let mut registers = BTreeMap::new();
            for reg in group.descendants().filter(|n| n.has_tag_name("register")) {
                registers.insert(attr(reg, "name"), self.register(reg, &value_groups)?);
            }
            let caption = attr(group, "caption");

            let users: Vec<&(String, ModuleInstance)> = placements
                .iter()
                .filter(|(_, i)| i.register_group_ref.as_deref() == Some(name.as_str()))
                .collect();
            if users.is_empty() {
                let parsed = RegisterGroup {
                    name_in_module: group
                        .attribute("name-in-module")
                        .map(str::to_string)
                        .unwrap_or_else(|| name.clone()),
                    caption,
                    offset: self.number(group, "offset")?.unwrap_or(0),
                    registers,
                };
                module.register_groups.insert(name, parsed);
                continue;
            }

            // One placed copy per instance, at that instance's offset.
            for (key, instance) in users {
                debug!(
                    group = %name,
                    instance = %instance.name,
                    offset = instance.offset,
                    "Placing register group"
                );
                module.register_groups.insert(
                    key.clone(),
                    RegisterGroup {
                        name_in_module: name.clone(),
                        caption: caption.clone(),
                        offset: instance.offset,
                        registers: registers.clone(),
                    },
                );
            }
        }

        Ok(module)
    }

    fn instance(&self, node: Node) -> Result<ModuleInstance, DescriptorError> {
        let group = elements(node, "register-group").next();
        let (register_group_ref, offset, address_space) = match group {
            Some(g) => (
                g.attribute("name-in-module")
                    .or_else(|| g.attribute("name"))
                    .map(str::to_string),
                self.number(g, "offset")?.unwrap_or(0),
                g.attribute("address-space").map(str::to_string),
            ),
            None => (None, 0, None),
        };
        Ok(ModuleInstance {
            name: attr(node, "name"),
            register_group_ref,
            offset,
            address_space,
        })
    }

    fn value_groups(
        &self,
        module: Node,
    ) -> Result<BTreeMap<String, BTreeMap<String, EnumeratedValue>>, DescriptorError> {
        let mut groups = BTreeMap::new();
        for group in elements(module, "value-group") {
            groups.insert(attr(group, "name"), self.values(group)?);
        }
        Ok(groups)
    }

    fn values(&self, node: Node) -> Result<BTreeMap<String, EnumeratedValue>, DescriptorError> {
        let mut values = BTreeMap::new();
        for value in elements(node, "value") {
            values.insert(
                attr(value, "name"),
                EnumeratedValue {
                    caption: attr(value, "caption"),
                    value: self.required_number(value, "value")?,
                },
            );
        }
        Ok(values)
    }

    fn register(
        &self,
        node: Node,
        value_groups: &BTreeMap<String, BTreeMap<String, EnumeratedValue>>,
    ) -> Result<Register, DescriptorError> {
        let access = match node.attribute("rw").or_else(|| node.attribute("access")) {
            Some(text) => text
                .parse::<Access>()
                .map_err(|e| malformed(self.path, e))?,
            None => Access::default(),
        };

        let mut bitfields = BTreeMap::new();
        for field in elements(node, "bitfield") {
            let mut enumerated_values = self.values(field)?;
            if let Some(group) = field.attribute("values").and_then(|v| value_groups.get(v)) {
                enumerated_values.extend(group.clone());
            }
            bitfields.insert(
                attr(field, "name"),
                Bitfield {
                    caption: attr(field, "caption"),
                    mask: self.required_number(field, "mask")?,
                    enumerated_values,
                },
            );
        }

        Ok(Register {
            caption: attr(node, "caption"),
            offset: self.required_number(node, "offset")?,
            size: self.number(node, "size")?.unwrap_or(1),
            mask: self.number(node, "mask")?,
            access,
            bitfields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const ATMEGA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<avr-tools-device-file schema-version="0.3">
  <devices>
    <device name="ATmega328P" architecture="AVR8" family="megaAVR">
      <address-spaces>
        <address-space name="prog" id="prog" start="0x0000" size="0x8000">
          <memory-segment start="0x0000" size="0x8000" type="flash" rw="RW" name="FLASH" pagesize="0x80"/>
        </address-space>
        <address-space name="signatures" id="signatures" start="0" size="3">
          <memory-segment start="0" size="3" type="signatures" name="SIGNATURES"/>
        </address-space>
        <address-space name="data" id="data" start="0x0000" size="0x0900">
          <memory-segment start="0x0000" size="0x0020" type="regs" name="REGISTERS"/>
          <memory-segment start="0x0100" size="0x0800" type="ram" name="IRAM"/>
        </address-space>
        <address-space name="eeprom" id="eeprom" start="0x0000" size="0x0400">
          <memory-segment start="0x0000" size="0x0400" type="eeprom" name="EEPROM" pagesize="0x04"/>
        </address-space>
      </address-spaces>
      <peripherals>
        <module name="PORT">
          <instance name="PORTB" caption="I/O Port">
            <register-group name="PORTB" name-in-module="PORTB" offset="0x00" address-space="data"/>
          </instance>
          <instance name="PORTC" caption="I/O Port">
            <register-group name="PORTC" name-in-module="PORTC" offset="0x00" address-space="data"/>
          </instance>
        </module>
        <module name="TC0">
          <instance name="TC0">
            <register-group name="TC0" name-in-module="TC0" offset="0x00" address-space="data"/>
          </instance>
        </module>
      </peripherals>
      <interrupts>
        <interrupt index="0" name="RESET" caption="External Pin, Power-on Reset"/>
        <interrupt index="16" name="TIMER0_OVF" caption="Timer/Counter0 Overflow" module-instance="TC0"/>
      </interrupts>
    </device>
  </devices>
  <modules>
    <module name="PORT" caption="I/O Port">
      <register-group name="PORTB" caption="I/O Port">
        <register caption="Port B Data Register" name="PORTB" offset="0x25" size="1" mask="0xFF"/>
        <register caption="Port B Input Pins" name="PINB" offset="0x23" size="1" mask="0xFF" rw="R"/>
      </register-group>
      <register-group name="PORTC" caption="I/O Port">
        <register caption="Port C Data Register" name="PORTC" offset="0x28" size="1" mask="0x7F"/>
      </register-group>
    </module>
    <module name="TC0" caption="Timer/Counter, 8-bit">
      <register-group name="TC0" caption="Timer/Counter, 8-bit">
        <register caption="Control Register A" name="TCCR0A" offset="0x44" size="1" mask="0xF3">
          <bitfield caption="Waveform Generation Mode" mask="0x03" name="WGM0" values="WGM_MODE"/>
          <bitfield caption="Compare Output Mode A" mask="0xC0" name="COM0A">
            <value caption="Normal port operation" name="NORMAL" value="0x0"/>
            <value caption="Toggle on match" name="TOGGLE" value="0x1"/>
          </bitfield>
        </register>
        <register caption="Counter" name="TCNT0" offset="0x46" size="1" mask="0xFF"/>
      </register-group>
      <value-group name="WGM_MODE">
        <value caption="Normal" name="NORMAL" value="0"/>
        <value caption="PWM, Phase Correct" name="PWM_PC" value="0b01"/>
      </value-group>
    </module>
  </modules>
</avr-tools-device-file>
"#;

    fn parse(text: &str, mcu: &str) -> Result<DeviceMetadata, DescriptorError> {
        AtdfParser.parse_str(text, mcu, &PathBuf::from("ATmega328P.atdf"))
    }

    #[test]
    fn test_memories() {
        let meta = parse(ATMEGA, "atmega328p").unwrap();
        assert_eq!(meta.device_name, "ATmega328P");
        assert_eq!(meta.memories.len(), 3);

        let flash = &meta.memories["FLASH"];
        assert_eq!((flash.start, flash.size), (0, 0x8000));
        assert_eq!(flash.kind, MemoryKind::Flash);
        assert_eq!(flash.page_size, Some(0x80));

        assert_eq!(meta.memories["IRAM"].kind, MemoryKind::Ram);
        assert_eq!(meta.memories["EEPROM"].kind, MemoryKind::Eeprom);
        assert!(!meta.memories.contains_key("REGISTERS"));
        assert!(!meta.memories.contains_key("SIGNATURES"));
    }

    #[test]
    fn test_modules_and_instances() {
        let meta = parse(ATMEGA, "ATMEGA328P").unwrap();
        let port = &meta.modules["PORT"];
        assert_eq!(port.caption, "I/O Port");
        let names: Vec<_> = port.instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["PORTB", "PORTC"]);
        assert_eq!(port.instances[0].register_group_ref.as_deref(), Some("PORTB"));
        assert_eq!(port.instances[0].address_space.as_deref(), Some("data"));

        let portb = &port.register_groups["PORTB"];
        assert_eq!(portb.offset, 0);
        assert_eq!(portb.registers["PORTB"].offset, 0x25);
        assert_eq!(portb.registers["PORTB"].mask, Some(0xFF));
        assert_eq!(portb.registers["PORTB"].access, Access::ReadWrite);
        assert_eq!(portb.registers["PINB"].access, Access::ReadOnly);
    }

    #[test]
    fn test_bitfields_and_values() {
        let meta = parse(ATMEGA, "atmega328p").unwrap();
        let tccr0a = &meta.modules["TC0"].register_groups["TC0"].registers["TCCR0A"];
        let wgm = &tccr0a.bitfields["WGM0"];
        assert_eq!(wgm.mask, 0x03);
        assert_eq!(wgm.enumerated_values["PWM_PC"].value, 1);
        assert_eq!(wgm.enumerated_values.len(), 2);

        let com = &tccr0a.bitfields["COM0A"];
        assert_eq!(com.enumerated_values["TOGGLE"].caption, "Toggle on match");
    }

    #[test]
    fn test_interrupts_and_peripherals() {
        let meta = parse(ATMEGA, "atmega328p").unwrap();
        assert_eq!(meta.interrupts["RESET"].index, 0);
        assert_eq!(meta.interrupts["RESET"].owning_module_instance, None);
        assert_eq!(
            meta.interrupts["TIMER0_OVF"].owning_module_instance.as_deref(),
            Some("TC0")
        );
        assert_eq!(meta.peripherals["PORT"].instances.len(), 2);
    }

    #[test]
    fn test_absolute_register_addresses() {
        let meta = parse(ATMEGA, "atmega328p").unwrap();
        assert_eq!(meta.register_at(0x25).unwrap().name, "PORTB");
        assert_eq!(meta.register_at(0x46).unwrap().name, "TCNT0");
        assert!(meta.register_at(0x45).is_none());
    }

    #[test]
    fn test_shared_group_placed_per_instance() {
        let text = r#"<avr-tools-device-file>
  <devices>
    <device name="ATxmega128A1">
      <peripherals>
        <module name="PORT">
          <instance name="PORTA">
            <register-group name="PORTA" name-in-module="PORT" offset="0x0400" address-space="data"/>
          </instance>
          <instance name="PORTB">
            <register-group name="PORTB" name-in-module="PORT" offset="0x0420" address-space="data"/>
          </instance>
        </module>
      </peripherals>
    </device>
  </devices>
  <modules>
    <module name="PORT" caption="I/O Ports">
      <register-group name="PORT" caption="I/O Ports">
        <register caption="I/O Port Data Direction" name="DIR" offset="0x00" size="1"/>
        <register caption="I/O Port Output" name="OUT" offset="0x04" size="1"/>
      </register-group>
    </module>
  </modules>
</avr-tools-device-file>
"#;
        let meta = parse(text, "atxmega128a1").unwrap();
        let port = &meta.modules["PORT"];
        let groups: Vec<_> = port.register_groups.keys().map(String::as_str).collect();
        assert_eq!(groups, vec!["PORTA", "PORTB"]);
        assert_eq!(port.register_groups["PORTB"].name_in_module, "PORT");
        assert_eq!(port.register_groups["PORTB"].offset, 0x420);

        let a = meta.register_at(0x400).unwrap();
        assert_eq!((a.name, a.group), ("DIR", "PORTA"));
        let b = meta.register_at(0x420).unwrap();
        assert_eq!((b.name, b.group), ("DIR", "PORTB"));
        assert_eq!(meta.register_at(0x424).unwrap().group, "PORTB");
        assert_eq!(meta.register_count(), 4);
    }

    #[test]
    fn test_device_mismatch() {
        let err = parse(ATMEGA, "atmega2560").unwrap_err();
        assert!(matches!(
            err,
            DescriptorError::DeviceMismatch { ref found, .. } if found == "ATmega328P"
        ));
    }

    #[test]
    fn test_malformed_xml() {
        let err = parse("<avr-tools-device-file><devices>", "x").unwrap_err();
        assert!(matches!(err, DescriptorError::MalformedInput { .. }));
    }

    #[test]
    fn test_bad_number_is_malformed() {
        let text = ATMEGA.replace(r#"size="0x8000" type="flash""#, r#"size="lots" type="flash""#);
        let err = parse(&text, "atmega328p").unwrap_err();
        assert!(matches!(err, DescriptorError::MalformedInput { .. }));
    }
}
