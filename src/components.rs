use std::collections::HashMap;

use anyhow::{ensure, Result};

use crate::heap::{HeapModel, ObjRef};

/// Masks over components and categories are 32-bit, so a components set can
/// hold at most 32 of each, the uncategorized entries included.
pub const MAX_COMPONENTS: usize = 32;
pub const MAX_CATEGORIES: usize = 32;

pub const UNCATEGORIZED_LABEL: &str = "uncategorized";

#[derive(Clone, Debug)]
pub struct ComponentCategory {
    id: u8,
    label: String,
}

impl ComponentCategory {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Clone, Debug)]
pub struct Component {
    id: u8,
    category_id: u8,
    label: String,
}

impl Component {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn category_id(&self) -> u8 {
        self.category_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Static classification of heap objects into components.
///
/// An object belongs to at most one component, resolved by the concrete
/// class name of the object; a component belongs to exactly one category.
pub struct ComponentsSet {
    categories: Vec<ComponentCategory>,
    components: Vec<Component>,
    root_class_to_component: HashMap<String, u8>,
    root_package_to_component: Vec<(String, u8)>,
    uncategorized_component_id: u8,
    uncategorized_category_id: u8,
}

impl ComponentsSet {
    pub fn builder() -> ComponentsSetBuilder {
        ComponentsSetBuilder::default()
    }

    /// The component whose roots include `o`, or None. An exact class-name
    /// entry wins over package prefixes; among prefixes the longest wins.
    pub fn component_of<M: HeapModel>(&self, model: &M, o: ObjRef) -> Option<&Component> {
        let class = model.class_of(o)?;
        let name = model.class_name(class);
        if let Some(&id) = self.root_class_to_component.get(name) {
            return Some(&self.components[id as usize]);
        }
        self.root_package_to_component
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|&(_, id)| &self.components[id as usize])
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn categories(&self) -> &[ComponentCategory] {
        &self.categories
    }

    pub fn uncategorized_component(&self) -> &Component {
        &self.components[self.uncategorized_component_id as usize]
    }

    pub fn uncategorized_category(&self) -> &ComponentCategory {
        &self.categories[self.uncategorized_category_id as usize]
    }
}

/// Builds a [`ComponentsSet`]; the uncategorized component and category are
/// appended automatically with the last ids.
#[derive(Default)]
pub struct ComponentsSetBuilder {
    categories: Vec<ComponentCategory>,
    components: Vec<Component>,
    root_class_to_component: HashMap<String, u8>,
    root_package_to_component: Vec<(String, u8)>,
}

impl ComponentsSetBuilder {
    pub fn add_category(&mut self, label: &str) -> Result<u8> {
        ensure!(
            self.categories.len() < MAX_CATEGORIES - 1,
            "too many component categories"
        );
        let id = self.categories.len() as u8;
        self.categories.push(ComponentCategory {
            id,
            label: label.to_owned(),
        });
        Ok(id)
    }

    pub fn add_component(
        &mut self,
        category_id: u8,
        label: &str,
        root_class_names: &[&str],
    ) -> Result<u8> {
        ensure!(
            self.components.len() < MAX_COMPONENTS - 1,
            "too many components"
        );
        ensure!(
            (category_id as usize) < self.categories.len(),
            "unknown category id {}",
            category_id
        );
        let id = self.components.len() as u8;
        self.components.push(Component {
            id,
            category_id,
            label: label.to_owned(),
        });
        for name in root_class_names {
            // first match by registration order wins
            self.root_class_to_component
                .entry((*name).to_owned())
                .or_insert(id);
        }
        Ok(id)
    }

    /// Every class whose name starts with `prefix` becomes a root of the
    /// component, unless an exact class-name registration claims it first.
    pub fn add_package_prefix(&mut self, component_id: u8, prefix: &str) -> Result<()> {
        ensure!(
            (component_id as usize) < self.components.len(),
            "unknown component id {}",
            component_id
        );
        self.root_package_to_component
            .push((prefix.to_owned(), component_id));
        Ok(())
    }

    pub fn build(mut self) -> ComponentsSet {
        let uncategorized_category_id = self.categories.len() as u8;
        self.categories.push(ComponentCategory {
            id: uncategorized_category_id,
            label: UNCATEGORIZED_LABEL.to_owned(),
        });
        let uncategorized_component_id = self.components.len() as u8;
        self.components.push(Component {
            id: uncategorized_component_id,
            category_id: uncategorized_category_id,
            label: UNCATEGORIZED_LABEL.to_owned(),
        });
        ComponentsSet {
            categories: self.categories,
            components: self.components,
            root_class_to_component: self.root_class_to_component,
            root_package_to_component: self.root_package_to_component,
            uncategorized_component_id,
            uncategorized_category_id,
        }
    }
}
