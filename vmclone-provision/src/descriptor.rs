//! Libvirt domain descriptor parsing and rewriting.
//!
//! The template is streamed through `quick-xml` event by event so every
//! element the editor does not care about (CPU model, channels, graphics,
//! comments) is written back untouched. Only four things change:
//!
//! - `/domain/name` text becomes the instance name
//! - `/domain/uuid` text becomes a fresh v4 UUID
//! - `/domain/devices/disk/source/@file` points at the cloned disk
//! - `/domain/devices/interface/mac/@address` gets a random `52:54:00` MAC

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rand::Rng;
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;

/// Summary of the fields the provisioning workflow reads back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainDescriptor {
    /// `/domain/name`
    pub name: String,
    /// `/domain/uuid`, if present
    pub uuid: Option<String>,
    /// `file` attributes of `/domain/devices/disk/source`, in document order
    pub disk_sources: Vec<String>,
    /// `address` attributes of `/domain/devices/interface/mac`
    pub mac_addresses: Vec<String>,
}

impl DomainDescriptor {
    /// Parse a descriptor document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<String> = Vec::new();
        let mut descriptor = DomainDescriptor::default();
        let mut saw_name = false;

        loop {
            let event = reader.read_event().map_err(|e| malformed(&reader, e))?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let name = local_name(e)?;
                    check_root(&stack, &name)?;
                    if is_disk_source(&stack, &name) {
                        if let Some(file) = attribute(e, b"file")? {
                            descriptor.disk_sources.push(file);
                        }
                    }
                    if is_interface_mac(&stack, &name) {
                        if let Some(address) = attribute(e, b"address")? {
                            descriptor.mac_addresses.push(address);
                        }
                    }
                    if is_top_level(&stack, &name, "name") {
                        saw_name = true;
                    }
                    if matches!(event, Event::Start(_)) {
                        stack.push(name);
                    }
                }
                Event::Text(ref t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| ProvisionError::MalformedDescriptor(e.to_string()))?;
                    if in_top_level(&stack, "name") {
                        descriptor.name.push_str(text.trim());
                    } else if in_top_level(&stack, "uuid") {
                        descriptor.uuid = Some(text.trim().to_string());
                    }
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        check_closed(&stack)?;
        if !saw_name {
            return Err(ProvisionError::MalformedDescriptor(
                "missing /domain/name element".to_string(),
            ));
        }
        Ok(descriptor)
    }

    /// Read and parse a descriptor file.
    pub async fn load(ctx: &PrivilegedContext, path: &Path) -> Result<Self> {
        let xml = ctx.read_to_string(path).await?;
        Self::parse(&xml)
    }
}

/// Rewrites a cloned descriptor for a new instance.
#[derive(Debug, Clone, Default)]
pub struct DomainDescriptorEditor;

impl DomainDescriptorEditor {
    pub fn new() -> Self {
        Self
    }

    /// Point the descriptor at `disk_path`, rename it to `instance_name`, and
    /// regenerate its hardware identity. The file is replaced in full.
    #[instrument(
        skip(self, ctx),
        fields(descriptor = %descriptor_path.display(), disk = %disk_path.display())
    )]
    pub async fn apply(
        &self,
        ctx: &PrivilegedContext,
        descriptor_path: &Path,
        instance_name: &str,
        disk_path: &Path,
    ) -> Result<()> {
        if instance_name.trim().is_empty() {
            return Err(ProvisionError::InvalidArgument("instance name must not be empty".into()));
        }
        tokio::fs::metadata(disk_path)
            .await
            .map_err(|e| ProvisionError::io(disk_path, e))?;

        let disk = disk_path.to_str().ok_or_else(|| {
            ProvisionError::InvalidArgument(format!(
                "disk path {} is not UTF-8",
                disk_path.display()
            ))
        })?;

        let template = ctx.read_to_string(descriptor_path).await?;

        let rewritten = rewrite_descriptor(&template, instance_name, disk)?;
        debug!(xml = %rewritten, "Rewritten domain XML");

        ctx.write_file(descriptor_path, rewritten.as_bytes()).await?;

        info!(instance = %instance_name, "Domain descriptor written");
        Ok(())
    }
}

/// Rewrite descriptor text for a new instance.
///
/// Fails with `MalformedDescriptor` unless the document has a `domain` root,
/// a top-level `name` and at least one disk source.
pub fn rewrite_descriptor(xml: &str, instance_name: &str, disk_path: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut stack: Vec<String> = Vec::new();
    // Depth inside an element whose content was replaced; its original
    // children are dropped until the matching end tag.
    let mut skip_depth = 0usize;
    let mut names = 0usize;
    let mut sources = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| malformed(&reader, e))?;

        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(e) => {
                    skip_depth -= 1;
                    if skip_depth == 0 {
                        stack.pop();
                        write(&mut writer, Event::End(e))?;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            continue;
        }

        match event {
            Event::Start(e) => {
                let name = local_name(&e)?;
                check_root(&stack, &name)?;

                if let Some(text) = replaced_text(&stack, &name, instance_name) {
                    if name == "name" {
                        names += 1;
                    }
                    write(&mut writer, Event::Start(e))?;
                    write(&mut writer, Event::Text(BytesText::new(&text)))?;
                    stack.push(name);
                    skip_depth = 1;
                    continue;
                }

                let e = rewrite_attributes(&stack, &name, e, disk_path, &mut sources)?;
                write(&mut writer, Event::Start(e))?;
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e)?;
                check_root(&stack, &name)?;

                if let Some(text) = replaced_text(&stack, &name, instance_name) {
                    if name == "name" {
                        names += 1;
                    }
                    let end = BytesEnd::new(name.clone());
                    write(&mut writer, Event::Start(e))?;
                    write(&mut writer, Event::Text(BytesText::new(&text)))?;
                    write(&mut writer, Event::End(end))?;
                    continue;
                }

                let e = rewrite_attributes(&stack, &name, e, disk_path, &mut sources)?;
                write(&mut writer, Event::Empty(e))?;
            }
            Event::End(e) => {
                stack.pop();
                write(&mut writer, Event::End(e))?;
            }
            Event::Eof => break,
            other => write(&mut writer, other)?,
        }
    }

    check_closed(&stack)?;
    if names == 0 {
        return Err(ProvisionError::MalformedDescriptor(
            "missing /domain/name element".to_string(),
        ));
    }
    if sources == 0 {
        return Err(ProvisionError::MalformedDescriptor(
            "missing /domain/devices/disk/source element".to_string(),
        ));
    }

    String::from_utf8(writer.into_inner())
        .map_err(|e| ProvisionError::MalformedDescriptor(e.to_string()))
}

/// New text content for elements whose content is replaced wholesale.
fn replaced_text(stack: &[String], name: &str, instance_name: &str) -> Option<String> {
    if is_top_level(stack, name, "name") {
        Some(instance_name.to_string())
    } else if is_top_level(stack, name, "uuid") {
        Some(uuid::Uuid::new_v4().to_string())
    } else {
        None
    }
}

/// Rewrite the disk source and MAC attributes, passing other elements through.
fn rewrite_attributes<'a>(
    stack: &[String],
    name: &str,
    e: BytesStart<'a>,
    disk_path: &str,
    sources: &mut usize,
) -> Result<BytesStart<'a>> {
    if is_disk_source(stack, name) {
        *sources += 1;
        return replace_attribute(e, b"file", disk_path);
    }
    if is_interface_mac(stack, name) {
        let mac = random_mac();
        return replace_attribute(e, b"address", &mac);
    }
    Ok(e)
}

/// Copy `e` with `key` set to `value`, adding the attribute if it was absent.
fn replace_attribute<'a>(e: BytesStart<'a>, key: &[u8], value: &str) -> Result<BytesStart<'a>> {
    let element = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let key_str = String::from_utf8_lossy(key).into_owned();
    let mut out = BytesStart::new(element);
    let mut replaced = false;

    for attr in e.attributes() {
        let attr = attr.map_err(|err| ProvisionError::MalformedDescriptor(err.to_string()))?;
        if attr.key.as_ref() == key {
            out.push_attribute((key_str.as_str(), value));
            replaced = true;
        } else {
            out.push_attribute(attr);
        }
    }
    if !replaced {
        out.push_attribute((key_str.as_str(), value));
    }
    Ok(out.into_owned())
}

/// Random MAC in the QEMU/KVM locally administered range.
pub fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

// =============================================================================
// Element path helpers
// =============================================================================

fn is_top_level(stack: &[String], name: &str, wanted: &str) -> bool {
    name == wanted && stack.len() == 1 && stack[0] == "domain"
}

fn in_top_level(stack: &[String], wanted: &str) -> bool {
    stack.len() == 2 && stack[0] == "domain" && stack[1] == wanted
}

fn is_disk_source(stack: &[String], name: &str) -> bool {
    name == "source"
        && stack.len() == 3
        && stack[0] == "domain"
        && stack[1] == "devices"
        && stack[2] == "disk"
}

fn is_interface_mac(stack: &[String], name: &str) -> bool {
    name == "mac"
        && stack.len() == 3
        && stack[0] == "domain"
        && stack[1] == "devices"
        && stack[2] == "interface"
}

fn check_root(stack: &[String], name: &str) -> Result<()> {
    if stack.is_empty() && name != "domain" {
        return Err(ProvisionError::MalformedDescriptor(format!(
            "root element is <{}>, expected <domain>",
            name
        )));
    }
    Ok(())
}

fn check_closed(stack: &[String]) -> Result<()> {
    match stack.last() {
        Some(open) => Err(ProvisionError::MalformedDescriptor(format!(
            "unexpected end of document inside <{}>",
            open
        ))),
        None => Ok(()),
    }
}

fn local_name(e: &BytesStart<'_>) -> Result<String> {
    std::str::from_utf8(e.local_name().as_ref())
        .map(str::to_string)
        .map_err(|err| ProvisionError::MalformedDescriptor(err.to_string()))
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ProvisionError::MalformedDescriptor(err.to_string()))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|err| ProvisionError::MalformedDescriptor(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| ProvisionError::MalformedDescriptor(e.to_string()))
}

fn malformed(reader: &Reader<&[u8]>, e: quick_xml::Error) -> ProvisionError {
    ProvisionError::MalformedDescriptor(format!(
        "XML error at byte {}: {}",
        reader.buffer_position(),
        e
    ))
}
