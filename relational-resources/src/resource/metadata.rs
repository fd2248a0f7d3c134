//! The physical layout of resources.
//!
//! Every resource is stored in a _main structure_ (a table) holding one row per resource. Scalar
//! leaves are flattened into columns named by their `_`-joined path; nested objects and arrays get
//! a boolean _presence column_ at their own flattened path, so that `null` and absent objects
//! survive a round trip. Each array is stored in a _satellite structure_ with one row per element,
//! linked to its parent row through `_parentId` and to the owning resource through `_resourceId`.
//!
//! [`Metadata`] is derived from a [`Schema`] once and never changes afterwards. Everything that
//! needs to know where a field lives (the field resolver, the payload structurer, the registration
//! of structures, the error normalizer) consults it, or walks the schema with a [`Location`], which
//! applies the same naming rules.

use super::schema::{Node, Object, Resource, Scalar, ScalarType, Schema, ID_FIELD};
use crate::error::{Error, Result};
use convert_case::{Boundary, Case, Casing};
use std::collections::BTreeMap;

/// The column linking a satellite row to the row it is an element of.
pub const PARENT_ID: &str = "_parentId";
/// The column linking a satellite row to the resource which owns it.
pub const RESOURCE_ID: &str = "_resourceId";
/// The position of an element in its array.
pub const INDEX: &str = "_index";
/// The value of a scalar array element, or the presence marker of a structured one.
pub const VALUE: &str = "_value";
/// The soft-deletion marker of a resource.
pub const IS_DELETED: &str = "_isDeleted";

/// The name of the main structure of a resource.
pub fn structure_name(resource: &str) -> String {
    use Boundary::*;
    resource
        .with_boundaries(&[Hyphen, Underscore, Space, LowerUpper])
        .to_case(Case::Snake)
}

/// Join a field name onto a dotted path.
pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// A position in the physical layout: a structure, plus the path from the structure's root to the
/// object we are currently in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub structure: String,
    prefix: Vec<String>,
}

impl Location {
    /// The root of the main structure of `resource`.
    pub fn root(resource: &str) -> Self {
        Self {
            structure: structure_name(resource),
            prefix: vec![],
        }
    }

    /// The column holding the field `name` of the current object.
    ///
    /// For a leaf this is the column storing its value. For an object or an array it is the
    /// presence column.
    pub fn column(&self, name: &str) -> String {
        self.prefix
            .iter()
            .map(String::as_str)
            .chain([name])
            .collect::<Vec<_>>()
            .join("_")
    }

    /// The location of the fields of the object stored at field `name`.
    pub fn object(&self, name: &str) -> Self {
        let mut prefix = self.prefix.clone();
        prefix.push(name.to_string());
        Self {
            structure: self.structure.clone(),
            prefix,
        }
    }

    /// The location of the elements of the array stored at field `name`.
    ///
    /// Elements which are objects keep their fields at the root of this location. Any other
    /// element is stored (or marked present) in the [`VALUE`] column.
    pub fn array(&self, name: &str) -> Self {
        Self {
            structure: format!("{}_{}", self.structure, self.column(name)),
            prefix: vec![],
        }
    }
}

/// A column in a structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ScalarType,
    /// The logical path of the field stored in this column. System columns have none.
    pub path: Option<String>,
}

impl Column {
    fn system(name: &str, ty: ScalarType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            path: None,
        }
    }
}

/// A table: the main structure of a resource or the satellite of one of its arrays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Structure {
    pub name: String,
    /// The structure this one's rows are elements of. `None` for the main structure.
    pub parent: Option<String>,
    /// The logical path of the array stored here. Empty for the main structure.
    pub path: String,
    pub columns: Vec<Column>,
}

impl Structure {
    pub fn is_satellite(&self) -> bool {
        self.parent.is_some()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|col| col.name == name)
    }
}

/// An index on a single column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Index {
    pub structure: String,
    pub column: String,
    pub unique: bool,
}

/// A foreign key from a column to the `_id` of another structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    pub structure: String,
    pub column: String,
    pub target: String,
    /// Deleting the target deletes the referencing row. Otherwise the deletion is rejected.
    pub cascade: bool,
}

/// A place where one resource stores references to another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationSite {
    /// The logical path of the relation in the referencing resource.
    pub path: String,
    pub structure: String,
    pub column: String,
}

/// The physical layout of one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub resource: String,
    /// The name of the main structure.
    pub structure: String,
    /// All structures, main first, every satellite after its parent.
    pub structures: Vec<Structure>,
    pub indexes: Vec<Index>,
    pub foreign_keys: Vec<ForeignKey>,
    /// Relations held by this resource, as (target resource, site).
    pub relations: Vec<(String, RelationSite)>,
    /// For every resource holding relations to this one, the sites of those relations.
    pub inverted_relations: BTreeMap<String, Vec<RelationSite>>,
    pub soft_delete: bool,
}

impl ResourceMetadata {
    pub fn structure(&self, name: &str) -> Option<&Structure> {
        self.structures.iter().find(|s| s.name == name)
    }

    pub fn main(&self) -> &Structure {
        // The main structure is always pushed first.
        &self.structures[0]
    }

    pub fn satellites(&self) -> impl Iterator<Item = &Structure> {
        self.structures.iter().filter(|s| s.is_satellite())
    }

    /// The logical path of the field stored in `column` of `structure`, if it stores one.
    pub fn logical_path(&self, structure: &str, column: &str) -> Option<&str> {
        self.structure(structure)?.column(column)?.path.as_deref()
    }
}

/// The physical layout of every resource in a schema.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    resources: BTreeMap<String, ResourceMetadata>,
    /// The resource owning each structure.
    owners: BTreeMap<String, String>,
}

impl Metadata {
    /// Derive the layout of every resource in `schema`.
    ///
    /// # Errors
    ///
    /// Fails with `INVALID_SCHEMA` if two fields flatten to the same column, or two structures to
    /// the same name.
    pub fn build(schema: &Schema) -> Result<Self> {
        let mut metadata = Self::default();
        for resource in schema.resources() {
            let meta = Builder::new(resource).build()?;
            for structure in &meta.structures {
                if let Some(owner) = metadata
                    .owners
                    .insert(structure.name.clone(), meta.resource.clone())
                {
                    return Err(Error::invalid_schema(format!(
                        "structure {} of {} collides with a structure of {owner}",
                        structure.name, meta.resource
                    )));
                }
            }
            metadata.resources.insert(meta.resource.clone(), meta);
        }

        // Invert the relations so each resource knows who references it.
        let edges = metadata
            .resources
            .values()
            .flat_map(|meta| {
                meta.relations
                    .iter()
                    .map(|(target, site)| (target.clone(), meta.resource.clone(), site.clone()))
            })
            .collect::<Vec<_>>();
        for (target, owner, site) in edges {
            if let Some(target) = metadata.resources.get_mut(&target) {
                target
                    .inverted_relations
                    .entry(owner)
                    .or_default()
                    .push(site);
            }
        }

        Ok(metadata)
    }

    pub fn resource(&self, name: &str) -> Result<&ResourceMetadata> {
        self.resources
            .get(name)
            .ok_or_else(|| Error::unknown_resource(name))
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceMetadata> {
        self.resources.values()
    }

    /// The resource which owns `structure`.
    pub fn owner(&self, structure: &str) -> Option<&ResourceMetadata> {
        self.resources.get(self.owners.get(structure)?)
    }
}

struct Builder<'a> {
    resource: &'a Resource,
    main: String,
    structures: Vec<Structure>,
    indexes: Vec<Index>,
    foreign_keys: Vec<ForeignKey>,
    relations: Vec<(String, RelationSite)>,
}

impl<'a> Builder<'a> {
    fn new(resource: &'a Resource) -> Self {
        Self {
            resource,
            main: structure_name(&resource.name),
            structures: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            relations: vec![],
        }
    }

    fn build(mut self) -> Result<ResourceMetadata> {
        let root = Location::root(&self.resource.name);
        let mut columns = vec![Column {
            name: ID_FIELD.into(),
            ty: ScalarType::Id,
            path: Some(ID_FIELD.into()),
        }];
        if self.resource.soft_delete {
            columns.push(Column::system(IS_DELETED, ScalarType::Boolean));
        }
        self.structures.push(Structure {
            name: self.main.clone(),
            parent: None,
            path: String::new(),
            columns,
        });
        self.object(&root, "", &self.resource.fields)?;

        Ok(ResourceMetadata {
            resource: self.resource.name.clone(),
            structure: self.main,
            structures: self.structures,
            indexes: self.indexes,
            foreign_keys: self.foreign_keys,
            relations: self.relations,
            inverted_relations: Default::default(),
            soft_delete: self.resource.soft_delete,
        })
    }

    fn object(&mut self, at: &Location, path: &str, object: &Object) -> Result<()> {
        for (name, node) in &object.fields {
            self.node(at, name, &join_path(path, name), node)?;
        }
        Ok(())
    }

    fn node(&mut self, at: &Location, name: &str, path: &str, node: &Node) -> Result<()> {
        match node {
            // A null field has nothing to store.
            Node::Null => Ok(()),
            Node::Scalar(scalar) => self.leaf(at, name, path, scalar),
            Node::Object(object) => {
                self.column(at, &at.column(name), ScalarType::Boolean, Some(path))?;
                self.object(&at.object(name), path, object)
            }
            Node::Array(array) => {
                self.column(at, &at.column(name), ScalarType::Boolean, Some(path))?;
                let elements = at.array(name);
                self.satellite(at, &elements, path)?;
                match &*array.items {
                    Node::Object(object) => {
                        self.column(&elements, VALUE, ScalarType::Boolean, Some(path))?;
                        self.object(&elements, path, object)
                    }
                    items => self.node(&elements, VALUE, path, items),
                }
            }
        }
    }

    fn leaf(&mut self, at: &Location, name: &str, path: &str, scalar: &Scalar) -> Result<()> {
        let column = at.column(name);
        self.column(at, &column, scalar.ty, Some(path))?;
        if scalar.unique {
            self.index(&at.structure, &column, true);
        } else if scalar.indexed || scalar.relation.is_some() {
            self.index(&at.structure, &column, false);
        }
        if let Some(relation) = &scalar.relation {
            self.foreign_keys.push(ForeignKey {
                structure: at.structure.clone(),
                column: column.clone(),
                target: structure_name(&relation.resource),
                cascade: false,
            });
            self.relations.push((
                relation.resource.clone(),
                RelationSite {
                    path: path.to_string(),
                    structure: at.structure.clone(),
                    column,
                },
            ));
        }
        Ok(())
    }

    fn satellite(&mut self, parent: &Location, at: &Location, path: &str) -> Result<()> {
        if self.structures.iter().any(|s| s.name == at.structure) {
            return Err(Error::invalid_schema(format!(
                "array {path} of {} collides with structure {}",
                self.resource.name, at.structure
            )));
        }
        self.structures.push(Structure {
            name: at.structure.clone(),
            parent: Some(parent.structure.clone()),
            path: path.to_string(),
            columns: vec![
                Column::system(ID_FIELD, ScalarType::Id),
                Column::system(PARENT_ID, ScalarType::Id),
                Column::system(RESOURCE_ID, ScalarType::Id),
                Column::system(INDEX, ScalarType::Integer),
            ],
        });
        let targets = [
            (PARENT_ID, parent.structure.clone()),
            (RESOURCE_ID, self.main.clone()),
        ];
        for (column, target) in targets {
            self.foreign_keys.push(ForeignKey {
                structure: at.structure.clone(),
                column: column.to_string(),
                target,
                cascade: true,
            });
            self.index(&at.structure, column, false);
        }
        Ok(())
    }

    fn column(
        &mut self,
        at: &Location,
        name: &str,
        ty: ScalarType,
        path: Option<&str>,
    ) -> Result<()> {
        let resource = &self.resource.name;
        let Some(structure) = self.structures.iter_mut().find(|s| s.name == at.structure) else {
            return Err(Error::invalid_schema(format!(
                "no structure {} in {resource}",
                at.structure
            )));
        };
        if structure.column(name).is_some() {
            return Err(Error::invalid_schema(format!(
                "field {} of {resource} collides with column {}.{name}",
                path.unwrap_or(name),
                structure.name
            )));
        }
        structure.columns.push(Column {
            name: name.to_string(),
            ty,
            path: path.map(String::from),
        });
        Ok(())
    }

    fn index(&mut self, structure: &str, column: &str, unique: bool) {
        self.indexes.push(Index {
            structure: structure.to_string(),
            column: column.to_string(),
            unique,
        });
    }
}
