//! Builder compiles a ResourceGraphDefinition into a runnable [`Graph`].
//!
//! Compilation is deterministic: naming checks, schema synthesis, expression
//! analysis, dependency ordering, and a dry run of every expression against
//! emulated objects all happen here, so the runtime never re-parses
//! anything.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps, JSONSchemaPropsOrArray,
    JSONSchemaPropsOrBool, ValidationRule,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::GroupVersionKind;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, instrument, trace};

use api::v1alpha1;

use crate::dag::DirectedAcyclicGraph;
use crate::expr::{self, Dependency};
use crate::resource::{FieldKind, Resource, ResourceField};
use crate::{emulator, fieldpath, infer, simpleschema, Error, Result};

/// INSTANCE_ID is the pseudo-id the instance occupies in the graph.
pub const INSTANCE_ID: &str = "schema";

/// DEFAULT_GROUP is the API group of synthesized kinds unless overridden.
pub const DEFAULT_GROUP: &str = "kro.run";

// Words that cannot name a member because expressions give them meaning.
static RESERVED_IDS: &[&str] = &[
    "apiVersion",
    "externalRef",
    "graph",
    "instance",
    "kind",
    "metadata",
    "namespace",
    "object",
    "resourcegraphdefinition",
    "resources",
    "runtime",
    "schema",
    "serviceAccountName",
    "spec",
    "status",
    "variables",
    "vars",
    "version",
];

static KIND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("static pattern"));
static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][A-Za-z0-9]*$").expect("static pattern"));
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+(?:(?:alpha|beta)\d+)?$").expect("static pattern"));

/// ResolvedSchema is what the schema source knows about a kind.
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    /// The kind's OpenAPI schema.
    pub schema: JSONSchemaProps,
    /// Whether the kind is namespaced.
    pub namespaced: bool,
    /// The plural resource name.
    pub plural: String,
}

/// SchemaSource resolves the live OpenAPI schema and discovery metadata for
/// a kind.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Resolve returns the schema for `gvk`, or an error if the kind is not
    /// served.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedSchema>;
}

/// StaticSchemaSource serves schemas from a fixed map; used by tests and
/// offline compilation.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaSource {
    entries: HashMap<String, ResolvedSchema>,
}

impl StaticSchemaSource {
    /// New returns an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// With adds a schema for `gvk` and returns the source.
    pub fn with(mut self, gvk: &GroupVersionKind, resolved: ResolvedSchema) -> Self {
        self.entries.insert(gvk_key(gvk), resolved);
        self
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedSchema> {
        self.entries
            .get(&gvk_key(gvk))
            .cloned()
            .ok_or_else(|| Error::SchemaNotFound(gvk_key(gvk)))
    }
}

/// Gvk_key renders a gvk for map keys and messages.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

/// Parse_api_version splits an `apiVersion` string into group and version.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Graph is the compiled, immutable artifact the runtime executes.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Group/version/kind of the synthesized instance type.
    pub gvk: GroupVersionKind,
    /// Plural resource name of the instance type.
    pub plural: String,
    /// The synthesized CRD, ready to apply.
    pub crd: CustomResourceDefinition,
    /// An emulated instance, spec and status populated.
    pub emulated_instance: Value,
    /// The instance's status projection fields.
    pub status_fields: Vec<ResourceField>,
    /// Compiled members by id.
    pub resources: HashMap<String, Resource>,
    /// The dependency graph, including the instance pseudo-vertex.
    pub dag: DirectedAcyclicGraph,
    /// Every vertex in apply order; the instance pseudo-id comes first.
    pub topological_order: Vec<String>,
    /// Instance-namespace to service-account mapping for impersonation.
    pub default_service_accounts: BTreeMap<String, String>,
}

impl Graph {
    /// Resource returns the member compiled under `id`.
    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Resource_order iterates members in apply order.
    pub fn resource_order(&self) -> impl Iterator<Item = &Resource> {
        self.topological_order
            .iter()
            .filter(|id| id.as_str() != INSTANCE_ID)
            .filter_map(|id| self.resources.get(id))
    }

    /// Member_kinds reports the distinct GVKs of the graph's members.
    pub fn member_kinds(&self) -> Vec<GroupVersionKind> {
        let mut seen = HashSet::new();
        let mut kinds = Vec::new();
        for resource in self.resource_order() {
            if seen.insert(gvk_key(&resource.gvk)) {
                kinds.push(resource.gvk.clone());
            }
        }
        kinds
    }
}

/// GraphBuilder compiles definitions against a schema source.
pub struct GraphBuilder {
    schemas: Arc<dyn SchemaSource>,
}

impl GraphBuilder {
    /// New returns a builder resolving schemas from `schemas`.
    pub fn new(schemas: Arc<dyn SchemaSource>) -> Self {
        Self { schemas }
    }

    /// Build compiles `rgd` into a graph.
    #[instrument(skip_all, fields(name = rgd.metadata.name))]
    pub async fn build(&self, rgd: &v1alpha1::ResourceGraphDefinition) -> Result<Graph> {
        let spec = &rgd.spec;

        // Naming comes first; everything downstream trusts it.
        validate_names(spec)?;

        let group = spec
            .schema
            .group
            .clone()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());
        let version = spec.schema.api_version.clone();
        let kind = spec.schema.kind.clone();
        let gvk = GroupVersionKind {
            group: group.clone(),
            version: version.clone(),
            kind: kind.clone(),
        };
        let plural = format!("{}s", kind.to_lowercase());

        let empty = json!({});
        let spec_schema = simpleschema::transform(
            spec.schema.spec.as_ref().unwrap_or(&empty),
            spec.schema.types.as_ref(),
        )?;
        let api_version = if group.is_empty() {
            version.clone()
        } else {
            format!("{group}/{version}")
        };
        let mut emulated_instance = emulator::emulate_object(
            Some(&object_wrapper("spec", spec_schema.clone())),
            &api_version,
            &kind,
            "instance",
            Some("default"),
        )?;

        let known: HashSet<String> = spec
            .resources
            .iter()
            .map(|r| r.id.clone())
            .chain([INSTANCE_ID.to_string()])
            .collect();

        // Compile each member: schema, emulation, expression analysis.
        let mut resources = HashMap::new();
        let mut dag = DirectedAcyclicGraph::new();
        dag.add_vertex(INSTANCE_ID, 0)?;
        for (i, def) in spec.resources.iter().enumerate() {
            let resource = self.compile_resource(def, &known).await?;
            dag.add_vertex(&resource.id, i + 1)?;
            resources.insert(resource.id.clone(), resource);
        }
        for def in &spec.resources {
            let resource = &resources[&def.id];
            // Every member implicitly depends on the instance.
            let mut edges: Vec<String> = resource.dependencies.clone();
            edges.push(INSTANCE_ID.to_string());
            dag.add_dependencies(&resource.id, edges)?;
        }

        // Status inference runs against the emulated universe.
        let mut universe: HashMap<String, Value> = resources
            .iter()
            .map(|(id, r)| (id.clone(), r.emulated.clone()))
            .collect();
        universe.insert(INSTANCE_ID.to_string(), emulated_instance.clone());

        let status_fields = self.compile_status(spec, &known)?;
        let status_schema = infer_status(&status_fields, &universe)?;
        if let Some(status) = emulated_instance.as_object_mut() {
            status.insert("status".into(), emulator::emulate(&status_schema)?);
        }
        universe.insert(INSTANCE_ID.to_string(), emulated_instance.clone());

        // Dry-run every member expression before anything touches the
        // cluster.
        for resource in resources.values() {
            dry_run_resource(resource, &universe)?;
        }

        let crd = synthesize_crd(
            &group,
            &version,
            &kind,
            &plural,
            spec_schema,
            status_schema,
            &spec.schema.validation,
        );

        let topological_order = dag.topological_sort()?;
        debug!(order = ?topological_order, "compiled graph");

        Ok(Graph {
            gvk,
            plural,
            crd,
            emulated_instance,
            status_fields,
            resources,
            dag,
            topological_order,
            default_service_accounts: spec.default_service_accounts.clone(),
        })
    }

    #[instrument(skip_all, fields(id = def.id))]
    async fn compile_resource(
        &self,
        def: &v1alpha1::ResourceDefinition,
        known: &HashSet<String>,
    ) -> Result<Resource> {
        let id = def.id.clone();

        let (template, gvk) = resource_template(def)?;
        let is_crd_member =
            gvk.kind == "CustomResourceDefinition" && gvk.group == "apiextensions.k8s.io";

        let scanned = expr::scan(&template).map_err(Error::from)?;
        if is_crd_member {
            if let Some(field) = scanned.first() {
                return Err(Error::CrdExpression {
                    id,
                    path: field.path.clone(),
                });
            }
        }

        let (schema, namespaced, plural) = if is_crd_member {
            (None, false, "customresourcedefinitions".to_string())
        } else {
            let resolved = self.schemas.resolve(&gvk).await?;
            (Some(resolved.schema), resolved.namespaced, resolved.plural)
        };

        let namespace = namespaced.then(|| {
            def.external_ref
                .as_ref()
                .and_then(|r| r.metadata.namespace.clone())
                .unwrap_or_else(|| "default".to_string())
        });
        let emulated = emulator::emulate_object(
            schema.as_ref(),
            template
                .get("apiVersion")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            &gvk.kind,
            &id,
            namespace.as_deref(),
        )?;

        // Analyze every template expression.
        let mut variables = Vec::new();
        let mut dependencies: Vec<String> = Vec::new();
        for field in scanned {
            let mut field_deps: Vec<String> = Vec::new();
            let mut dynamic = false;
            for expression in &field.expressions {
                let inspection = inspect_expression(&id, &field.path, expression, known)?;
                for dep in &inspection.dependencies {
                    if dep.id == INSTANCE_ID {
                        // Instance status is runtime state; spec is not.
                        if dep.path.starts_with("schema.status") {
                            dynamic = true;
                        }
                        continue;
                    }
                    dynamic = true;
                    if !field_deps.contains(&dep.id) {
                        field_deps.push(dep.id.clone());
                    }
                }
            }
            for dep in &field_deps {
                if !dependencies.contains(dep) {
                    dependencies.push(dep.clone());
                }
            }
            let segments = fieldpath::parse(&field.path).map_err(Error::from)?;
            let original = fieldpath::get(&template, &segments)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let expected_type = schema
                .as_ref()
                .and_then(|s| schema_type_at(s, &segments));
            variables.push(ResourceField {
                path: field.path,
                expressions: field.expressions,
                kind: if dynamic {
                    FieldKind::Dynamic
                } else {
                    FieldKind::Static
                },
                standalone: field.standalone,
                original,
                expected_type,
                dependencies: field_deps,
            });
        }

        // Gates are restricted: includeWhen sees only the instance spec,
        // readyWhen sees only the member itself (and the instance).
        let mut include_when = Vec::new();
        for raw in &def.include_when {
            let expression = gate_expression(&id, raw)?;
            let inspection = inspect_expression(&id, "includeWhen", &expression, known)?;
            if let Some(dep) = inspection
                .dependencies
                .iter()
                .find(|d| d.id != INSTANCE_ID)
            {
                return Err(Error::GateReference {
                    id: id.clone(),
                    expression,
                    referenced: dep.id.clone(),
                });
            }
            include_when.push(expression);
        }
        let mut ready_when = Vec::new();
        for raw in &def.ready_when {
            let expression = gate_expression(&id, raw)?;
            let inspection = inspect_expression(&id, "readyWhen", &expression, known)?;
            if let Some(dep) = inspection
                .dependencies
                .iter()
                .find(|d| d.id != INSTANCE_ID && d.id != id)
            {
                return Err(Error::GateReference {
                    id: id.clone(),
                    expression,
                    referenced: dep.id.clone(),
                });
            }
            ready_when.push(expression);
        }

        trace!(
            variables = variables.len(),
            dependencies = ?dependencies,
            "compiled resource"
        );
        Ok(Resource {
            id,
            gvk,
            plural,
            namespaced,
            schema,
            template,
            emulated,
            variables,
            ready_when,
            include_when,
            external_ref: def.external_ref.clone(),
            dependencies,
        })
    }

    fn compile_status(
        &self,
        spec: &v1alpha1::ResourceGraphDefinitionSpec,
        known: &HashSet<String>,
    ) -> Result<Vec<ResourceField>> {
        let definition = match spec.schema.status.as_ref() {
            Some(definition) => definition,
            None => return Ok(Vec::new()),
        };
        let mut fields = Vec::new();
        for scanned in expr::scan(definition).map_err(Error::from)? {
            let mut field_deps = Vec::new();
            for expression in &scanned.expressions {
                let inspection =
                    inspect_expression(INSTANCE_ID, &scanned.path, expression, known)?;
                for dep in inspection.dependencies {
                    if dep.id != INSTANCE_ID && !field_deps.contains(&dep.id) {
                        field_deps.push(dep.id);
                    }
                }
            }
            let segments = fieldpath::parse(&scanned.path).map_err(Error::from)?;
            let original = fieldpath::get(definition, &segments)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            fields.push(ResourceField {
                path: scanned.path,
                expressions: scanned.expressions,
                kind: FieldKind::Dynamic,
                standalone: scanned.standalone,
                original,
                expected_type: None,
                dependencies: field_deps,
            });
        }
        Ok(fields)
    }
}

fn validate_names(spec: &v1alpha1::ResourceGraphDefinitionSpec) -> Result<()> {
    if !KIND_RE.is_match(&spec.schema.kind) {
        return Err(Error::InvalidKind {
            kind: spec.schema.kind.clone(),
        });
    }
    if !VERSION_RE.is_match(&spec.schema.api_version) {
        return Err(Error::InvalidApiVersion {
            version: spec.schema.api_version.clone(),
        });
    }
    let mut seen = HashSet::new();
    for def in &spec.resources {
        if !ID_RE.is_match(&def.id) {
            return Err(Error::InvalidResourceId { id: def.id.clone() });
        }
        if RESERVED_IDS
            .iter()
            .any(|w| w.eq_ignore_ascii_case(&def.id))
        {
            return Err(Error::ReservedId { id: def.id.clone() });
        }
        if !seen.insert(def.id.clone()) {
            return Err(Error::DuplicateId { id: def.id.clone() });
        }
    }
    Ok(())
}

fn resource_template(
    def: &v1alpha1::ResourceDefinition,
) -> Result<(Value, GroupVersionKind)> {
    if let Some(external) = def.external_ref.as_ref() {
        let (group, version) = parse_api_version(&external.api_version);
        let gvk = GroupVersionKind {
            group,
            version,
            kind: external.kind.clone(),
        };
        let mut template = json!({
            "apiVersion": external.api_version,
            "kind": external.kind,
            "metadata": { "name": external.metadata.name },
        });
        if let Some(ns) = external.metadata.namespace.as_ref() {
            template["metadata"]["namespace"] = json!(ns);
        }
        return Ok((template, gvk));
    }

    let template = def.template.clone().ok_or_else(|| Error::MalformedTemplate {
        id: def.id.clone(),
        detail: "template or externalRef required".into(),
    })?;
    let malformed = |detail: &str| Error::MalformedTemplate {
        id: def.id.clone(),
        detail: detail.to_string(),
    };
    if !template.is_object() {
        return Err(malformed("template must be an object"));
    }
    let api_version = template
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing apiVersion"))?;
    let kind = template
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing kind"))?;
    if !template.get("metadata").is_some_and(Value::is_object) {
        return Err(malformed("missing metadata"));
    }
    let (group, version) = parse_api_version(api_version);
    let gvk = GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    };
    Ok((template, gvk))
}

// Gate entries are written either bare (`a == b`) or wrapped
// (`${a == b}`); both mean the same single expression.
fn gate_expression(id: &str, raw: &str) -> Result<String> {
    let (expressions, standalone) = expr::extract_expressions(raw).map_err(Error::from)?;
    match expressions.as_slice() {
        [] => Ok(raw.to_string()),
        [single] if standalone => Ok(single.clone()),
        _ => Err(Error::ExpressionCompile {
            id: id.to_string(),
            path: "readyWhen/includeWhen".to_string(),
            detail: format!("gate {raw:?} must be a single expression"),
        }),
    }
}

fn inspect_expression(
    id: &str,
    path: &str,
    expression: &str,
    known: &HashSet<String>,
) -> Result<expr::Inspection> {
    // Compiling first gives parse diagnostics before inspection.
    expr::compile(expression).map_err(|err| Error::ExpressionCompile {
        id: id.to_string(),
        path: path.to_string(),
        detail: err.to_string(),
    })?;
    let ast = expr::parse_ast(expression).map_err(|err| Error::ExpressionCompile {
        id: id.to_string(),
        path: path.to_string(),
        detail: err.to_string(),
    })?;
    let inspection = expr::inspect(&ast, known);
    if let Some(name) = inspection.unknown.first() {
        return Err(Error::UnknownReference {
            id: id.to_string(),
            path: path.to_string(),
            expression: expression.to_string(),
            name: name.clone(),
        });
    }
    Ok(inspection)
}

// Dry-run one resource's expressions and gates against the emulated
// universe, reporting type errors before any real apply.
fn dry_run_resource(resource: &Resource, universe: &HashMap<String, Value>) -> Result<()> {
    for field in &resource.variables {
        for expression in &field.expressions {
            let value = match dry_run(expression, universe)? {
                Some(value) => value,
                None => continue,
            };
            if field.standalone {
                if let Some(expected) = field.expected_type.as_deref() {
                    if !compatible(expected, &value) {
                        return Err(Error::TypeMismatch {
                            id: resource.id.clone(),
                            path: field.path.clone(),
                            expression: expression.clone(),
                            expected: expected.to_string(),
                            got: expr::eval::type_name(&value).to_string(),
                        });
                    }
                }
            } else if expr::coerce_string(&value, expression).is_err() {
                return Err(Error::TypeMismatch {
                    id: resource.id.clone(),
                    path: field.path.clone(),
                    expression: expression.clone(),
                    expected: "string".to_string(),
                    got: expr::eval::type_name(&value).to_string(),
                });
            }
        }
    }
    for expression in resource.include_when.iter().chain(&resource.ready_when) {
        match dry_run_bool(expression, universe) {
            Ok(_) | Err(None) => {}
            Err(Some(err)) => return Err(err),
        }
    }
    Ok(())
}

fn dry_run_bool(
    expression: &str,
    vars: &HashMap<String, Value>,
) -> std::result::Result<bool, Option<Error>> {
    match expr::evaluate_bool(expression, vars) {
        Ok(b) => Ok(b),
        Err(expr::Error::NonBoolean { expression, got }) => {
            Err(Some(Error::Expr(expr::Error::NonBoolean {
                expression,
                got,
            })))
        }
        // Anything else is an open-schema artifact; the real objects decide.
        Err(_) => Err(None),
    }
}

// Evaluate `expression` against emulated objects. `Ok(None)` means the
// expression crosses a part of the universe the schemas left open, so
// nothing can be proven about it.
fn dry_run(
    expression: &str,
    universe: &HashMap<String, Value>,
) -> Result<Option<Value>> {
    let ast = expr::parse_ast(expression).map_err(Error::from)?;
    let known: HashSet<String> = universe.keys().cloned().collect();
    let inspection = expr::inspect(&ast, &known);
    for dep in &inspection.dependencies {
        if path_is_open(universe, dep) {
            return Ok(None);
        }
    }
    expr::evaluate(expression, universe)
        .map(Some)
        .map_err(Error::from)
}

fn path_is_open(universe: &HashMap<String, Value>, dep: &Dependency) -> bool {
    let mut cur = match universe.get(&dep.id) {
        Some(value) => value,
        None => return true,
    };
    for segment in dep.path.split('.').skip(1) {
        loop {
            match cur {
                Value::Array(items) => match items.first() {
                    Some(first) => cur = first,
                    None => return true,
                },
                _ => break,
            }
        }
        match cur {
            Value::Object(map) => match map.get(segment) {
                Some(next) => cur = next,
                None => return true,
            },
            // Reading a member of a scalar is a real type error; let the
            // evaluation report it.
            _ => return false,
        }
    }
    false
}

fn infer_status(
    fields: &[ResourceField],
    universe: &HashMap<String, Value>,
) -> Result<JSONSchemaProps> {
    let mut values: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for field in fields {
        let mut evaluated = Vec::new();
        for expression in &field.expressions {
            match dry_run(expression, universe)? {
                Some(Value::Null) | None => {
                    // Open schemas leave the field untyped, and a null
                    // result is dropped from the projection at runtime;
                    // string is the only safe choice for either.
                    evaluated.push(Value::String(String::new()))
                }
                Some(value) => evaluated.push(value),
            }
        }
        values.insert(field.path.clone(), evaluated);
    }
    let mut schema = infer::infer_status_schema(&values)?;
    default_status_fields(&mut schema);
    Ok(schema)
}

// State and conditions are standard on every synthesized kind unless the
// user declared their own.
fn default_status_fields(schema: &mut JSONSchemaProps) {
    let properties = schema.properties.get_or_insert_with(BTreeMap::new);
    properties.entry("state".to_string()).or_insert(JSONSchemaProps {
        type_: Some("string".to_string()),
        ..Default::default()
    });
    properties
        .entry("conditions".to_string())
        .or_insert_with(conditions_schema);
}

fn conditions_schema() -> JSONSchemaProps {
    let string = |format: Option<&str>| JSONSchemaProps {
        type_: Some("string".to_string()),
        format: format.map(str::to_string),
        ..Default::default()
    };
    let condition = JSONSchemaProps {
        type_: Some("object".to_string()),
        required: Some(vec!["status".into(), "type".into()]),
        properties: Some(BTreeMap::from([
            ("type".to_string(), string(None)),
            ("status".to_string(), string(None)),
            ("reason".to_string(), string(None)),
            ("message".to_string(), string(None)),
            ("lastTransitionTime".to_string(), string(Some("date-time"))),
            (
                "observedGeneration".to_string(),
                JSONSchemaProps {
                    type_: Some("integer".to_string()),
                    ..Default::default()
                },
            ),
        ])),
        ..Default::default()
    };
    JSONSchemaProps {
        type_: Some("array".to_string()),
        items: Some(JSONSchemaPropsOrArray::Schema(Box::new(condition))),
        x_kubernetes_list_type: Some("map".to_string()),
        x_kubernetes_list_map_keys: Some(vec!["type".to_string()]),
        ..Default::default()
    }
}

fn object_wrapper(field: &str, schema: JSONSchemaProps) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(BTreeMap::from([(field.to_string(), schema)])),
        ..Default::default()
    }
}

fn schema_type_at(schema: &JSONSchemaProps, segments: &[fieldpath::Segment]) -> Option<String> {
    let mut cur = schema;
    for segment in segments {
        if cur.x_kubernetes_preserve_unknown_fields.unwrap_or(false) {
            return None;
        }
        cur = match segment {
            fieldpath::Segment::Field(name) | fieldpath::Segment::Key(name) => {
                match cur.properties.as_ref().and_then(|p| p.get(name)) {
                    Some(next) => next,
                    None => match cur.additional_properties.as_ref() {
                        Some(JSONSchemaPropsOrBool::Schema(values)) => values.as_ref(),
                        _ => return None,
                    },
                }
            }
            fieldpath::Segment::Index(_) => match cur.items.as_ref() {
                Some(JSONSchemaPropsOrArray::Schema(items)) => items.as_ref(),
                Some(JSONSchemaPropsOrArray::Schemas(list)) => list.first()?,
                None => return None,
            },
        };
    }
    if cur.x_kubernetes_int_or_string.unwrap_or(false) {
        return None;
    }
    cur.type_.clone()
}

fn compatible(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn synthesize_crd(
    group: &str,
    version: &str,
    kind: &str,
    plural: &str,
    mut spec_schema: JSONSchemaProps,
    status_schema: JSONSchemaProps,
    validation: &[String],
) -> CustomResourceDefinition {
    if !validation.is_empty() {
        spec_schema.x_kubernetes_validations = Some(
            validation
                .iter()
                .map(|rule| ValidationRule {
                    rule: rule.clone(),
                    ..Default::default()
                })
                .collect(),
        );
    }
    let root = JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(BTreeMap::from([
            ("spec".to_string(), spec_schema),
            ("status".to_string(), status_schema),
        ])),
        ..Default::default()
    };
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(format!("{plural}.{group}")),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: group.to_string(),
            names: CustomResourceDefinitionNames {
                kind: kind.to_string(),
                list_kind: Some(format!("{kind}List")),
                plural: plural.to_string(),
                singular: Some(kind.to_lowercase()),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: version.to_string(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(root),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(CustomResourceSubresourceStatus(serde_json::Value::Object(
                        Default::default(),
                    ))),
                    ..Default::default()
                }),
                additional_printer_columns: Some(vec![
                    CustomResourceColumnDefinition {
                        name: "State".to_string(),
                        type_: "string".to_string(),
                        json_path: ".status.state".to_string(),
                        ..Default::default()
                    },
                    CustomResourceColumnDefinition {
                        name: "Synced".to_string(),
                        type_: "string".to_string(),
                        json_path: ".status.conditions[?(@.type=='InstanceSynced')].status"
                            .to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}
