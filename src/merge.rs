//! Merging of concurrently-pending requests into one combined document.
//!
//! Every top-level field of constituent `i` is aliased through
//! [`crate::alias::encode`], and the constituent's variable and fragment
//! names are namespaced the same way, so the combined document carries no
//! side table: the keys of the combined response decode straight back to
//! `(constituent index, original response key)` for the splitter.

use std::collections::HashMap;
use std::collections::HashSet;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;

use crate::alias;
use crate::context::Context;
use crate::error::FetchError;
use crate::executor::ExecutionRequest;
use crate::graphql;
use crate::json_ext::Object;

/// The single synthetic request standing in for a whole batch.
///
/// Created once per flush and discarded after the combined response has been
/// split back into constituent results.
#[derive(Debug)]
pub struct MergedRequest {
    request: ExecutionRequest,
    count: usize,
}

impl MergedRequest {
    /// How many constituents were merged into this request.
    pub fn count(&self) -> usize {
        self.count
    }

    /// The synthetic request and the constituent count it stands for.
    pub fn into_parts(self) -> (ExecutionRequest, usize) {
        (self.request, self.count)
    }
}

/// Shallow-merges each constituent's request extensions; later constituents'
/// keys win. This is the default reducer for [`merge_operations`].
pub fn default_extensions_reducer(mut merged: Object, next: &Object) -> Object {
    for (key, value) in next.iter() {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Merge an ordered batch of requests sharing one operation kind into a
/// single [`MergedRequest`], using [`default_extensions_reducer`].
pub fn merge_operations(requests: Vec<ExecutionRequest>) -> Result<MergedRequest, FetchError> {
    merge_operations_with(requests, default_extensions_reducer)
}

/// Merge an ordered batch of requests sharing one operation kind into a
/// single [`MergedRequest`].
///
/// The reducer is invoked once per constituent, in encounter order, to fold
/// the constituents' request extensions into the merged request's.
///
/// A single-constituent batch short-circuits to a passthrough: the request is
/// returned untouched and no parse or merge cost is paid.
pub fn merge_operations_with(
    mut requests: Vec<ExecutionRequest>,
    mut extensions_reducer: impl FnMut(Object, &Object) -> Object,
) -> Result<MergedRequest, FetchError> {
    let count = requests.len();
    if count == 0 {
        return Err(FetchError::MalformedRequest {
            reason: "cannot merge an empty batch".to_string(),
        });
    }
    if count == 1 {
        let request = requests.remove(0);
        return Ok(MergedRequest { request, count });
    }

    let operation_kind = requests[0].operation_kind;
    let operation_type = operation_kind.into();

    let mut selections: Vec<ast::Selection> = Vec::new();
    let mut variable_definitions: Vec<Node<ast::VariableDefinition>> = Vec::new();
    let mut operation_directives: Vec<Node<ast::Directive>> = Vec::new();
    let mut fragments: Vec<Node<ast::FragmentDefinition>> = Vec::new();
    let mut variables = Object::new();
    let mut extensions = Object::new();
    let mut context: Option<Context> = None;

    for (index, execution_request) in requests.iter().enumerate() {
        if execution_request.operation_kind != operation_kind {
            return Err(FetchError::MalformedRequest {
                reason: format!(
                    "constituent {index} is a {} in a batch of {} operations",
                    execution_request.operation_kind, operation_kind,
                ),
            });
        }

        let request = &execution_request.request;
        let query = request
            .query
            .as_deref()
            .ok_or_else(|| FetchError::MalformedRequest {
                reason: format!("constituent {index} has no query document"),
            })?;
        let document = ast::Document::parse(query, "operation.graphql").map_err(|errors| {
            FetchError::MalformedRequest {
                reason: format!("constituent {index} failed to parse: {errors}"),
            }
        })?;
        let operation = find_operation(&document, request.operation_name.as_deref(), index)?;
        if operation.operation_type != operation_type {
            return Err(FetchError::MalformedRequest {
                reason: format!(
                    "constituent {index} resolves to a {:?} operation but was submitted as a {}",
                    operation.operation_type, operation_kind,
                ),
            });
        }

        let variable_names: HashSet<String> = operation
            .variables
            .iter()
            .map(|definition| definition.name.as_str().to_string())
            .collect();
        let fragment_names: HashSet<String> = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                ast::Definition::FragmentDefinition(fragment) => {
                    Some(fragment.name.as_str().to_string())
                }
                _ => None,
            })
            .collect();

        for definition in &operation.variables {
            let mut renamed = definition.clone();
            let node = renamed.make_mut();
            node.name = encoded_name(index, node.name.as_str())?;
            variable_definitions.push(renamed);
        }
        operation_directives.extend(operation.directives.0.iter().cloned());

        // Coalesce duplicate selections before aliasing: once the index alias
        // is applied nothing at the top level is mergeable any more.
        let mut operation_selections = dedupe_selections(operation.selection_set.clone());
        rewrite_selections(&mut operation_selections, &variable_names, &fragment_names, index)?;
        for selection in &mut operation_selections {
            let ast::Selection::Field(field) = selection else {
                return Err(FetchError::MalformedRequest {
                    reason: format!(
                        "constituent {index} has a top-level fragment, which cannot be aliased for batching"
                    ),
                });
            };
            let field = field.make_mut();
            let key = field
                .alias
                .as_ref()
                .unwrap_or(&field.name)
                .as_str()
                .to_string();
            field.alias = Some(encoded_name(index, &key)?);
        }
        selections.extend(operation_selections);

        for definition in &document.definitions {
            if let ast::Definition::FragmentDefinition(fragment) = definition {
                let mut renamed = fragment.clone();
                let node = renamed.make_mut();
                node.name = encoded_name(index, node.name.as_str())?;
                rewrite_directives(&mut node.directives, &variable_names, index)?;
                rewrite_selections(
                    &mut node.selection_set,
                    &variable_names,
                    &fragment_names,
                    index,
                )?;
                fragments.push(renamed);
            }
        }

        for (name, value) in request.variables.iter() {
            variables.insert(alias::encode(index, name.as_str()), value.clone());
        }
        extensions = extensions_reducer(extensions, &request.extensions);
        if context.is_none() {
            context = Some(execution_request.context.clone());
        }
    }

    let operation = ast::OperationDefinition {
        operation_type,
        name: None,
        variables: variable_definitions,
        directives: ast::DirectiveList(operation_directives),
        selection_set: selections,
    };
    let mut document = ast::Document::new();
    document
        .definitions
        .push(ast::Definition::OperationDefinition(Node::new(operation)));
    document
        .definitions
        .extend(fragments.into_iter().map(ast::Definition::FragmentDefinition));

    let request = graphql::Request::builder()
        .query(document.to_string())
        .variables(variables)
        .extensions(extensions)
        .build();
    let request = ExecutionRequest::builder()
        .request(request)
        .operation_kind(operation_kind)
        .context(context.unwrap_or_default())
        .build();

    Ok(MergedRequest { request, count })
}

fn find_operation<'a>(
    document: &'a ast::Document,
    operation_name: Option<&str>,
    index: usize,
) -> Result<&'a Node<ast::OperationDefinition>, FetchError> {
    document
        .definitions
        .iter()
        .find_map(|definition| match definition {
            ast::Definition::OperationDefinition(operation) => match operation_name {
                Some(name) => (operation.name.as_ref().map(|n| n.as_str()) == Some(name))
                    .then_some(operation),
                None => Some(operation),
            },
            _ => None,
        })
        .ok_or_else(|| FetchError::MalformedRequest {
            reason: match operation_name {
                Some(name) => {
                    format!("constituent {index} has no operation named {name:?}")
                }
                None => format!("constituent {index} has no operation definition"),
            },
        })
}

fn encoded_name(index: usize, name: &str) -> Result<Name, FetchError> {
    Name::new(&alias::encode(index, name)).map_err(|_| FetchError::MalformedRequest {
        reason: format!("cannot derive a merged alias for {name:?}"),
    })
}

fn rewrite_selections(
    selections: &mut Vec<ast::Selection>,
    variables: &HashSet<String>,
    fragments: &HashSet<String>,
    index: usize,
) -> Result<(), FetchError> {
    for selection in selections.iter_mut() {
        match selection {
            ast::Selection::Field(node) => {
                let field = node.make_mut();
                rewrite_arguments(&mut field.arguments, variables, index)?;
                rewrite_directives(&mut field.directives, variables, index)?;
                rewrite_selections(&mut field.selection_set, variables, fragments, index)?;
            }
            ast::Selection::FragmentSpread(node) => {
                let spread = node.make_mut();
                if fragments.contains(spread.fragment_name.as_str()) {
                    spread.fragment_name = encoded_name(index, spread.fragment_name.as_str())?;
                }
                rewrite_directives(&mut spread.directives, variables, index)?;
            }
            ast::Selection::InlineFragment(node) => {
                let fragment = node.make_mut();
                rewrite_directives(&mut fragment.directives, variables, index)?;
                rewrite_selections(&mut fragment.selection_set, variables, fragments, index)?;
            }
        }
    }
    Ok(())
}

fn rewrite_arguments(
    arguments: &mut [Node<ast::Argument>],
    variables: &HashSet<String>,
    index: usize,
) -> Result<(), FetchError> {
    for argument in arguments.iter_mut() {
        let argument = argument.make_mut();
        rewrite_value(&mut argument.value, variables, index)?;
    }
    Ok(())
}

fn rewrite_value(
    value: &mut Node<ast::Value>,
    variables: &HashSet<String>,
    index: usize,
) -> Result<(), FetchError> {
    match value.make_mut() {
        ast::Value::Variable(name) => {
            if variables.contains(name.as_str()) {
                *name = encoded_name(index, name.as_str())?;
            }
        }
        ast::Value::List(values) => {
            for value in values.iter_mut() {
                rewrite_value(value, variables, index)?;
            }
        }
        ast::Value::Object(fields) => {
            for (_, value) in fields.iter_mut() {
                rewrite_value(value, variables, index)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn rewrite_directives(
    directives: &mut ast::DirectiveList,
    variables: &HashSet<String>,
    index: usize,
) -> Result<(), FetchError> {
    for directive in directives.0.iter_mut() {
        let directive = directive.make_mut();
        rewrite_arguments(&mut directive.arguments, variables, index)?;
    }
    Ok(())
}

/// Builds a selection set while coalescing duplicate selections.
///
/// Fields the caller did not alias are kept once per field name; when a
/// repeated field carries sub-selections on both occurrences, the
/// sub-selection sets are merged and deduplicated recursively. Caller-aliased
/// fields are always passed through distinct, because the alias already
/// disambiguates them.
#[derive(Default)]
pub struct SelectionSetBuilder {
    selections: Vec<ast::Selection>,
    merged_fields: HashMap<String, usize>,
    seen_spreads: HashSet<String>,
}

impl SelectionSetBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one selection, coalescing it into an earlier one where possible.
    pub fn add(&mut self, selection: ast::Selection) {
        match selection {
            ast::Selection::Field(node) => {
                if node.alias.is_some() {
                    self.selections.push(ast::Selection::Field(node));
                    return;
                }
                let key = node.name.as_str().to_string();
                if let Some(&position) = self.merged_fields.get(&key) {
                    if let ast::Selection::Field(existing) = &mut self.selections[position] {
                        if existing.arguments == node.arguments {
                            if !node.selection_set.is_empty() {
                                existing
                                    .make_mut()
                                    .selection_set
                                    .extend(node.selection_set.iter().cloned());
                            }
                            return;
                        }
                    }
                    // Same name, different arguments: not structurally
                    // identical, so both occurrences are forwarded and the
                    // response-key conflict stays visible to the server.
                    self.selections.push(ast::Selection::Field(node));
                } else {
                    self.merged_fields.insert(key, self.selections.len());
                    self.selections.push(ast::Selection::Field(node));
                }
            }
            ast::Selection::FragmentSpread(node) => {
                if self
                    .seen_spreads
                    .insert(node.fragment_name.as_str().to_string())
                {
                    self.selections.push(ast::Selection::FragmentSpread(node));
                }
            }
            ast::Selection::InlineFragment(mut node) => {
                let fragment = node.make_mut();
                fragment.selection_set =
                    dedupe_selections(std::mem::take(&mut fragment.selection_set));
                self.selections.push(ast::Selection::InlineFragment(node));
            }
        }
    }

    /// Finish the builder, deduplicating merged sub-selection sets depth-first.
    pub fn build(self) -> Vec<ast::Selection> {
        self.selections
            .into_iter()
            .map(|selection| match selection {
                ast::Selection::Field(mut node) => {
                    if !node.selection_set.is_empty() {
                        let field = node.make_mut();
                        field.selection_set =
                            dedupe_selections(std::mem::take(&mut field.selection_set));
                    }
                    ast::Selection::Field(node)
                }
                other => other,
            })
            .collect()
    }
}

/// Deduplicate a selection set, depth-first, through [`SelectionSetBuilder`].
pub fn dedupe_selections(selections: Vec<ast::Selection>) -> Vec<ast::Selection> {
    let mut builder = SelectionSetBuilder::new();
    for selection in selections {
        builder.add(selection);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::executor::OperationKind;

    fn parse_selections(query: &str) -> Vec<ast::Selection> {
        let document = ast::Document::parse(query, "test.graphql").unwrap();
        document
            .definitions
            .iter()
            .find_map(|definition| match definition {
                ast::Definition::OperationDefinition(operation) => {
                    Some(operation.selection_set.clone())
                }
                _ => None,
            })
            .unwrap()
    }

    fn field(selection: &ast::Selection) -> &ast::Field {
        match selection {
            ast::Selection::Field(node) => node,
            other => panic!("expected a field, got {other:?}"),
        }
    }

    fn request(query: &str) -> ExecutionRequest {
        ExecutionRequest::builder()
            .request(graphql::Request::builder().query(query.to_string()).build())
            .build()
    }

    #[test]
    fn merges_two_queries_with_index_aliases() {
        let merged = merge_operations(vec![
            request("{ topProducts { name } }"),
            request("{ me { id } }"),
        ])
        .unwrap();
        assert_eq!(merged.count(), 2);

        let (execution_request, count) = merged.into_parts();
        assert_eq!(count, 2);
        let query = execution_request.request.query.unwrap();
        assert!(query.contains("_0_topProducts: topProducts"), "{query}");
        assert!(query.contains("_1_me: me"), "{query}");
    }

    #[test]
    fn namespaces_colliding_variables_per_constituent() {
        let first = ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query("query($id: ID!) { product(id: $id) { name } }".to_string())
                    .variables(json!({ "id": "1" }).as_object().cloned().unwrap())
                    .build(),
            )
            .build();
        let second = ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query("query($id: ID!) { product(id: $id) { name } }".to_string())
                    .variables(json!({ "id": "2" }).as_object().cloned().unwrap())
                    .build(),
            )
            .build();

        let (execution_request, _) = merge_operations(vec![first, second])
            .unwrap()
            .into_parts();
        let query = execution_request.request.query.unwrap();
        assert!(query.contains("$_0_id: ID!"), "{query}");
        assert!(query.contains("$_1_id: ID!"), "{query}");
        assert!(query.contains("product(id: $_0_id)"), "{query}");
        assert!(query.contains("product(id: $_1_id)"), "{query}");

        let variables = execution_request.request.variables;
        assert_eq!(variables.get("_0_id"), Some(&json!("1")));
        assert_eq!(variables.get("_1_id"), Some(&json!("2")));
    }

    #[test]
    fn namespaces_fragments_per_constituent() {
        let (execution_request, _) = merge_operations(vec![
            request("{ me { ...parts } } fragment parts on User { id name }"),
            request("{ me { id } }"),
        ])
        .unwrap()
        .into_parts();
        let query = execution_request.request.query.unwrap();
        assert!(query.contains("..._0_parts"), "{query}");
        assert!(query.contains("fragment _0_parts on User"), "{query}");
    }

    #[test]
    fn extensions_reducer_runs_in_encounter_order() {
        let first = ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query("{ a }".to_string())
                    .extensions(json!({ "trace": 1, "first": true }).as_object().cloned().unwrap())
                    .build(),
            )
            .build();
        let second = ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query("{ b }".to_string())
                    .extensions(json!({ "trace": 2 }).as_object().cloned().unwrap())
                    .build(),
            )
            .build();

        let (execution_request, _) = merge_operations(vec![first, second])
            .unwrap()
            .into_parts();
        let extensions = execution_request.request.extensions;
        // Later constituents' keys win in the default shallow merge.
        assert_eq!(extensions.get("trace"), Some(&json!(2)));
        assert_eq!(extensions.get("first"), Some(&json!(true)));
    }

    #[test]
    fn single_constituent_passes_through_unchanged() {
        let query = "{ topProducts { name } }";
        let (execution_request, count) = merge_operations(vec![request(query)])
            .unwrap()
            .into_parts();
        assert_eq!(count, 1);
        assert_eq!(execution_request.request.query.as_deref(), Some(query));
    }

    #[test]
    fn rejects_mixed_operation_kinds() {
        let query = request("{ a }");
        let mutation = ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query("mutation { set }".to_string())
                    .build(),
            )
            .operation_kind(OperationKind::Mutation)
            .build();
        let error = merge_operations(vec![query, mutation]).unwrap_err();
        assert!(matches!(error, FetchError::MalformedRequest { .. }));
    }

    #[test]
    fn rejects_missing_query_document() {
        let first = request("{ a }");
        let second = ExecutionRequest::builder()
            .request(graphql::Request::builder().build())
            .build();
        let error = merge_operations(vec![first, second]).unwrap_err();
        assert_eq!(
            error,
            FetchError::MalformedRequest {
                reason: "constituent 1 has no query document".to_string(),
            }
        );
    }

    #[test]
    fn dedupes_repeated_fields_and_merges_their_sub_selections() {
        let deduped = dedupe_selections(parse_selections(
            "{ me { id name } me { name email } other }",
        ));
        assert_eq!(deduped.len(), 2);

        let me = field(&deduped[0]);
        assert_eq!(me.name.as_str(), "me");
        let sub_fields: Vec<&str> = me
            .selection_set
            .iter()
            .map(|selection| field(selection).name.as_str())
            .collect();
        assert_eq!(sub_fields, vec!["id", "name", "email"]);

        assert_eq!(field(&deduped[1]).name.as_str(), "other");
    }

    #[test]
    fn dedup_keeps_caller_aliased_fields_distinct() {
        let deduped = dedupe_selections(parse_selections(
            "{ first: product(id: 1) { name } second: product(id: 2) { name } }",
        ));
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn dedup_keeps_same_name_different_arguments_distinct() {
        let deduped = dedupe_selections(parse_selections(
            "{ product(id: 1) { name } product(id: 2) { name } }",
        ));
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn dedup_recurses_into_sub_selections() {
        let deduped = dedupe_selections(parse_selections(
            "{ me { friends { id } friends { name } } }",
        ));
        let me = field(&deduped[0]);
        assert_eq!(me.selection_set.len(), 1);
        let friends = field(&me.selection_set[0]);
        assert_eq!(friends.selection_set.len(), 2);
    }
}
