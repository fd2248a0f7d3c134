//! Instantiation of a resource [`DataSource`] for a SQL database.

use super::{db, ops};
use crate::{
    error::Result,
    resource::{
        backend::{DataSource, Page},
        metadata::Metadata,
        request::Request,
        schema::Schema,
        value::{Id, Value},
    },
};
use async_std::sync::Arc;
use async_trait::async_trait;
use std::collections::BTreeSet;

#[cfg(feature = "postgres")]
/// A data source implemented using a PostgreSQL database.
pub type PostgresDataSource = SqlDataSource<db::postgres::Connection>;

/// A data source implemented using a SQL database.
///
/// The schema and the layout derived from it are fixed when the data source is created, and
/// shared by clones of the data source.
#[derive(Clone, Debug)]
pub struct SqlDataSource<Db> {
    db: Db,
    schema: Arc<Schema>,
    metadata: Arc<Metadata>,
}

impl<Db: db::Connection> SqlDataSource<Db> {
    /// A data source serving the resources of `schema` from `db`.
    ///
    /// # Errors
    ///
    /// `INVALID_SCHEMA` if the resources of `schema` cannot be laid out in tables.
    pub fn new(db: Db, schema: Schema) -> Result<Self> {
        let metadata = Metadata::build(&schema)?;
        Ok(Self {
            db,
            schema: Arc::new(schema),
            metadata: Arc::new(metadata),
        })
    }

    /// The underlying connection to the database.
    pub fn inner(&self) -> &Db {
        &self.db
    }

    /// Unwrap this data source to get at the underlying connection.
    pub fn into_inner(self) -> Db {
        self.db
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

#[async_trait]
impl<Db: 'static + db::Connection> DataSource for SqlDataSource<Db> {
    async fn create_structures(&self) -> Result<()> {
        ops::register::execute(&self.db, &self.metadata).await
    }

    async fn search(&self, resource: &str, request: &Request) -> Result<Page> {
        ops::select::execute(&self.db, &self.schema, &self.metadata, resource, request).await
    }

    async fn view(
        &self,
        resource: &str,
        id: &Id,
        fields: &BTreeSet<String>,
        max_depth: usize,
    ) -> Result<Option<Value>> {
        ops::select::view(
            &self.db,
            &self.schema,
            &self.metadata,
            resource,
            id,
            fields,
            max_depth,
        )
        .await
    }

    async fn create(&self, resource: &str, payload: Value) -> Result<Id> {
        ops::insert::execute(&self.db, &self.schema, &self.metadata, resource, payload).await
    }

    async fn update(&self, resource: &str, id: &Id, payload: Value) -> Result<bool> {
        ops::update::execute(&self.db, &self.schema, &self.metadata, resource, id, payload).await
    }

    async fn delete(&self, resource: &str, id: &Id) -> Result<bool> {
        ops::delete::execute(&self.db, &self.metadata, resource, id).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        init_logging,
        resource::{
            request::{Filter, SortOrder, DEFAULT_MAX_DEPTH},
            schema::{Array, Object, Resource, Scalar},
        },
        sql::db::mock,
        Error,
    };
    use async_std::task::block_on;
    use proptest::{prelude::*, test_runner::Config};
    use rand::seq::SliceRandom;

    fn schema() -> Schema {
        Schema::new([
            Resource::new(
                "users",
                Object::new()
                    .field("name", Scalar::string().required().indexed())
                    .field("email", Scalar::string().unique())
                    .field("age", Scalar::integer().indexed())
                    .field("manager", Scalar::relation("users"))
                    .field(
                        "address",
                        Object::new()
                            .field("city", Scalar::string().indexed())
                            .field("zip", Scalar::string()),
                    )
                    .field("tags", Array::of(Scalar::string().indexed()))
                    .field(
                        "jobs",
                        Array::of(
                            Object::new()
                                .field("title", Scalar::string().required().indexed())
                                .field("company", Scalar::relation("companies")),
                        ),
                    ),
            )
            .soft_delete(),
            Resource::new(
                "companies",
                Object::new().field("name", Scalar::string().required().unique()),
            ),
            Resource::new(
                "blogPosts",
                Object::new()
                    .field("title", Scalar::string().required().indexed())
                    .field("author", Scalar::relation("users").required())
                    .field("editors", Array::of(Scalar::relation("users")))
                    .field("sections", Array::of(Scalar::string()).required()),
            ),
        ])
        .unwrap()
    }

    async fn data_source() -> SqlDataSource<mock::Connection> {
        init_logging();
        let ds = SqlDataSource::new(mock::Connection::create(), schema()).unwrap();
        ds.create_structures().await.unwrap();
        ds
    }

    fn fields<const N: usize>(paths: [&str; N]) -> BTreeSet<String> {
        paths.into_iter().map(String::from).collect()
    }

    fn user(name: &str) -> Value {
        Value::object([("name", name.into())])
    }

    fn post(title: &str, author: &Id) -> Value {
        Value::object([
            ("title", title.into()),
            ("author", Value::Id(author.clone())),
            ("sections", Value::array(["intro"])),
        ])
    }

    async fn view(ds: &SqlDataSource<mock::Connection>, id: &Id, paths: &[&str]) -> Option<Value> {
        let paths = paths.iter().map(|path| path.to_string()).collect();
        ds.view("users", id, &paths, DEFAULT_MAX_DEPTH)
            .await
            .unwrap()
    }

    #[async_std::test]
    async fn test_create_structures_idempotent() {
        let ds = data_source().await;
        let layout = ds.inner().schema().await;
        assert_eq!(
            layout.keys().collect::<Vec<_>>(),
            [
                "blog_posts",
                "blog_posts_editors",
                "blog_posts_sections",
                "companies",
                "users",
                "users_jobs",
                "users_tags",
            ]
        );
        ds.create_structures().await.unwrap();
        assert_eq!(ds.inner().schema().await, layout);
    }

    #[async_std::test]
    async fn test_round_trip() {
        let ds = data_source().await;
        let acme = ds
            .create("companies", Value::object([("name", "Acme".into())]))
            .await
            .unwrap();
        let ada = ds
            .create(
                "users",
                Value::object([
                    ("name", "Ada".into()),
                    ("email", "ada@example.com".into()),
                    ("age", 36.into()),
                    ("address", Value::object([("city", "London".into())])),
                    ("tags", Value::array(["math", "looms"])),
                    (
                        "jobs",
                        Value::array([
                            Value::object([
                                ("title", "Analyst".into()),
                                ("company", Value::Id(acme.clone())),
                            ]),
                            Value::object([("title", "Countess".into())]),
                        ]),
                    ),
                ]),
            )
            .await
            .unwrap();

        assert_eq!(
            view(
                &ds,
                &ada,
                &["name", "age", "address.*", "tags", "jobs.title", "jobs.company.name"]
            )
            .await
            .unwrap(),
            Value::object([
                ("_id", Value::Id(ada.clone())),
                ("name", "Ada".into()),
                ("age", 36.into()),
                (
                    "address",
                    Value::object([("city", "London".into()), ("zip", Value::Null)])
                ),
                ("tags", Value::array(["math", "looms"])),
                (
                    "jobs",
                    Value::array([
                        Value::object([
                            ("title", "Analyst".into()),
                            (
                                "company",
                                Value::object([
                                    ("_id", Value::Id(acme.clone())),
                                    ("name", "Acme".into())
                                ])
                            ),
                        ]),
                        Value::object([("title", "Countess".into()), ("company", Value::Null)]),
                    ])
                ),
            ])
        );

        // A bare relation comes back as an id.
        assert_eq!(
            view(&ds, &ada, &["jobs.company"]).await.unwrap(),
            Value::object([
                ("_id", Value::Id(ada.clone())),
                (
                    "jobs",
                    Value::array([
                        Value::object([("company", Value::Id(acme))]),
                        Value::object([("company", Value::Null)]),
                    ])
                ),
            ])
        );
        assert_eq!(view(&ds, &"nobody".into(), &["name"]).await, None);
    }

    #[async_std::test]
    async fn test_manager_join() {
        let ds = data_source().await;
        let ada = ds.create("users", user("Ada")).await.unwrap();
        let bob = ds
            .create(
                "users",
                Value::object([("name", "Bob".into()), ("manager", Value::Id(ada.clone()))]),
            )
            .await
            .unwrap();

        let page = ds
            .search(
                "users",
                &Request::new()
                    .fields(["name", "manager.name"])
                    .sort("name", SortOrder::Asc),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(
            page.results,
            [
                Value::object([
                    ("_id", Value::Id(ada.clone())),
                    ("name", "Ada".into()),
                    ("manager", Value::Null),
                ]),
                Value::object([
                    ("_id", Value::Id(bob.clone())),
                    ("name", "Bob".into()),
                    (
                        "manager",
                        Value::object([("_id", Value::Id(ada)), ("name", "Ada".into())])
                    ),
                ]),
            ]
        );

        // Filter through the relation.
        let page = ds
            .search(
                "users",
                &Request::new()
                    .field("name")
                    .filter("manager.name", Filter::eq("Ada")),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].get("name"), Some(&"Bob".into()));
    }

    #[async_std::test]
    async fn test_search_and_filters() {
        let ds = data_source().await;
        for (name, age, city, tags) in [
            ("Ada Lovelace", 36, "London", vec!["math"]),
            ("Grace Hopper", 85, "New York", vec!["navy", "compilers"]),
            ("Alan Turing", 41, "London", vec!["math", "compilers"]),
        ] {
            ds.create(
                "users",
                Value::object([
                    ("name", name.into()),
                    ("age", age.into()),
                    ("address", Value::object([("city", city.into())])),
                    ("tags", Value::array(tags)),
                ]),
            )
            .await
            .unwrap();
        }
        let names = |page: Page| {
            page.results
                .iter()
                .map(|result| result.get("name").cloned().unwrap_or_default())
                .collect::<Vec<_>>()
        };
        let request = || Request::new().field("name").sort("name", SortOrder::Asc);

        let page = ds
            .search("users", &request().search(["name"], "  lovelace ADA"))
            .await
            .unwrap();
        assert_eq!(names(page), [Value::from("Ada Lovelace")]);

        // An empty search matches everything.
        let page = ds
            .search("users", &request().search(["name"], " ,"))
            .await
            .unwrap();
        assert_eq!(page.total, 3);

        // `list` ignores the search.
        let page = ds
            .list("users", &request().search(["name"], "nobody"))
            .await
            .unwrap();
        assert_eq!(page.total, 3);

        // A match inside an array does not duplicate the resource.
        let page = ds
            .search(
                "users",
                &request().filter("tags", Filter::one_of(["math", "compilers"])),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(
            names(page),
            [
                Value::from("Ada Lovelace"),
                Value::from("Alan Turing"),
                Value::from("Grace Hopper")
            ]
        );

        let page = ds
            .search(
                "users",
                &request()
                    .filter("address.city", Filter::eq("London"))
                    .filter("age", Filter::at_least(40)),
            )
            .await
            .unwrap();
        assert_eq!(names(page), [Value::from("Alan Turing")]);

        let page = ds
            .search(
                "users",
                &Request::new()
                    .field("name")
                    .sort("age", SortOrder::Desc)
                    .filter("age", Filter::between(30, 50)),
            )
            .await
            .unwrap();
        assert_eq!(
            names(page),
            [Value::from("Alan Turing"), Value::from("Ada Lovelace")]
        );

        assert_eq!(
            ds.search("users", &request().filter("zip", Filter::eq("x")))
                .await
                .unwrap_err(),
            Error::UnknownField { path: "zip".into() }
        );
        assert_eq!(
            ds.search("users", &request().filter("address.zip", Filter::eq("x")))
                .await
                .unwrap_err(),
            Error::UnindexedField {
                path: "address.zip".into()
            }
        );
        assert_eq!(
            ds.search("users", &request().sort("tags", SortOrder::Asc))
                .await
                .unwrap_err(),
            Error::UnsortableField {
                path: "tags".into()
            }
        );
    }

    #[async_std::test]
    async fn test_pagination() {
        let ds = data_source().await;
        let mut names = (0..25).map(|i| format!("user{i:02}")).collect::<Vec<_>>();
        names.shuffle(&mut rand::thread_rng());
        for name in &names {
            ds.create("users", user(name)).await.unwrap();
        }

        let request = Request::new().field("name").sort("name", SortOrder::Asc);
        let page = ds
            .search("users", &request.clone().offset(20).limit(10))
            .await
            .unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(
            page.results
                .iter()
                .map(|result| result.get("name").cloned().unwrap())
                .collect::<Vec<_>>(),
            (20..25)
                .map(|i| Value::from(format!("user{i}")))
                .collect::<Vec<_>>()
        );

        // Past the end there are no results, but the total is still exact.
        let page = ds
            .search("users", &request.offset(30))
            .await
            .unwrap();
        assert_eq!(page.total, 25);
        assert!(page.results.is_empty());
    }

    #[async_std::test]
    async fn test_depth() {
        let ds = data_source().await;
        let ada = ds.create("users", user("Ada")).await.unwrap();
        let bob = ds
            .create(
                "users",
                Value::object([("name", "Bob".into()), ("manager", Value::Id(ada.clone()))]),
            )
            .await
            .unwrap();
        let cat = ds
            .create(
                "users",
                Value::object([("name", "Cat".into()), ("manager", Value::Id(bob))]),
            )
            .await
            .unwrap();

        let paths = fields(["manager.manager.name"]);
        assert_eq!(
            ds.view("users", &cat, &paths, 1).await.unwrap_err(),
            Error::MaximumDepthExceeded {
                path: "manager.manager.name".into(),
                max_depth: 1
            }
        );
        let cat = ds.view("users", &cat, &paths, 2).await.unwrap().unwrap();
        assert_eq!(cat.get("manager.manager.name"), Some(&"Ada".into()));
        assert_eq!(cat.get("manager.manager._id"), Some(&Value::Id(ada)));
    }

    #[async_std::test]
    async fn test_required_array() {
        let ds = data_source().await;
        let ada = ds.create("users", user("Ada")).await.unwrap();
        let sections = |id: &Id| {
            let ds = ds.clone();
            let id = id.clone();
            async move {
                ds.view("blogPosts", &id, &fields(["sections", "editors"]), 0)
                    .await
                    .unwrap()
                    .unwrap()
            }
        };

        // Omitting a required array is an error, and writes nothing.
        assert_eq!(
            ds.create(
                "blogPosts",
                Value::object([("title", "Notes".into()), ("author", Value::Id(ada.clone()))])
            )
            .await
            .unwrap_err(),
            Error::MissingField {
                path: "sections".into()
            }
        );
        assert_eq!(ds.list("blogPosts", &Request::new()).await.unwrap().total, 0);

        // Null is stored as null, with no elements.
        let mut payload = post("Notes", &ada);
        if let Value::Object(fields) = &mut payload {
            fields.insert("sections".into(), Value::Null);
        }
        let nulled = ds.create("blogPosts", payload).await.unwrap();
        let post_view = sections(&nulled).await;
        assert_eq!(post_view.get("sections"), Some(&Value::Null));
        assert_eq!(post_view.get("editors"), Some(&Value::Null));
        assert!(ds
            .inner()
            .dump("blog_posts_sections")
            .await
            .unwrap()
            .is_empty());

        // An empty array is distinct from null.
        let mut payload = post("Notes", &ada);
        if let Value::Object(fields) = &mut payload {
            fields.insert("sections".into(), Value::Array(vec![]));
        }
        let empty = ds.create("blogPosts", payload).await.unwrap();
        assert_eq!(
            sections(&empty).await.get("sections"),
            Some(&Value::Array(vec![]))
        );

        // Updating to null clears the elements.
        let full = ds.create("blogPosts", post("Notes", &ada)).await.unwrap();
        assert_eq!(
            sections(&full).await.get("sections"),
            Some(&Value::array(["intro"]))
        );
        assert!(ds
            .update("blogPosts", &full, Value::object([("sections", Value::Null)]))
            .await
            .unwrap());
        assert_eq!(sections(&full).await.get("sections"), Some(&Value::Null));
        assert!(ds
            .inner()
            .dump("blog_posts_sections")
            .await
            .unwrap()
            .is_empty());
    }

    #[async_std::test]
    async fn test_duplicate() {
        let ds = data_source().await;
        let payload = |name: &str| {
            Value::object([("name", name.into()), ("email", "a@example.com".into())])
        };
        let ada = ds.create("users", payload("Ada")).await.unwrap();
        assert_eq!(
            ds.create("users", payload("Ada 2")).await.unwrap_err(),
            Error::DuplicateResource {
                path: "email".into(),
                value: "a@example.com".into()
            }
        );
        // Updating a resource to its own value is not a duplicate.
        assert!(ds.update("users", &ada, payload("Ada")).await.unwrap());
    }

    #[async_std::test]
    async fn test_update() {
        let ds = data_source().await;
        let ada = ds
            .create(
                "users",
                Value::object([
                    ("name", "Ada".into()),
                    ("age", 36.into()),
                    ("tags", Value::array(["math"])),
                ]),
            )
            .await
            .unwrap();

        assert!(ds
            .update(
                "users",
                &ada,
                Value::object([
                    ("age", 37.into()),
                    ("tags", Value::array(["math", "poetry"])),
                    ("address", Value::object([("city", "London".into())])),
                ]),
            )
            .await
            .unwrap());
        assert_eq!(
            view(&ds, &ada, &["name", "age", "tags", "address.city"])
                .await
                .unwrap(),
            Value::object([
                ("_id", Value::Id(ada.clone())),
                ("name", "Ada".into()),
                ("age", 37.into()),
                ("tags", Value::array(["math", "poetry"])),
                ("address", Value::object([("city", "London".into())])),
            ])
        );
        // Old elements are gone, not just hidden.
        assert_eq!(ds.inner().dump("users_tags").await.unwrap().len(), 2);

        assert!(ds
            .update("users", &ada, Value::object([("tags", Value::Null)]))
            .await
            .unwrap());
        assert_eq!(
            view(&ds, &ada, &["tags"]).await.unwrap().get("tags"),
            Some(&Value::Null)
        );
        assert!(ds.inner().dump("users_tags").await.unwrap().is_empty());

        assert_eq!(
            ds.update("users", &ada, Value::object([("name", Value::Null)]))
                .await
                .unwrap_err(),
            Error::MissingField {
                path: "name".into()
            }
        );
        assert_eq!(
            ds.update("users", &ada, Value::object([("manager", "nobody".into())]))
                .await
                .unwrap_err(),
            Error::NoResource {
                path: "manager".into(),
                id: "nobody".into()
            }
        );
        assert!(!ds
            .update("users", &"nobody".into(), Value::object([("age", 1.into())]))
            .await
            .unwrap());

        assert!(ds.delete("users", &ada).await.unwrap());
        assert!(!ds
            .update("users", &ada, Value::object([("age", 1.into())]))
            .await
            .unwrap());
    }

    #[async_std::test]
    async fn test_delete() {
        let ds = data_source().await;
        let ada = ds.create("users", user("Ada")).await.unwrap();
        let bob = ds.create("users", user("Bob")).await.unwrap();
        // Self-references do not block deletion.
        ds.update("users", &ada, Value::object([("manager", Value::Id(ada.clone()))]))
            .await
            .unwrap();

        let mut payload = post("Notes", &ada);
        if let Value::Object(fields) = &mut payload {
            fields.insert("editors".into(), Value::array([Value::Id(bob.clone())]));
        }
        let notes = ds.create("blogPosts", payload).await.unwrap();

        assert_eq!(
            ds.delete("users", &ada).await.unwrap_err(),
            Error::ResourceReferenced {
                resource: "blogPosts".into(),
                path: "author".into()
            }
        );
        assert_eq!(
            ds.delete("users", &bob).await.unwrap_err(),
            Error::ResourceReferenced {
                resource: "blogPosts".into(),
                path: "editors".into()
            }
        );

        // Hard delete takes the satellites along.
        assert!(ds.delete("blogPosts", &notes).await.unwrap());
        assert!(!ds.delete("blogPosts", &notes).await.unwrap());
        assert!(ds
            .inner()
            .dump("blog_posts_sections")
            .await
            .unwrap()
            .is_empty());

        // Soft delete hides the resource.
        assert!(ds.delete("users", &ada).await.unwrap());
        assert!(!ds.delete("users", &ada).await.unwrap());
        assert_eq!(view(&ds, &ada, &["name"]).await, None);
        assert_eq!(ds.list("users", &Request::new()).await.unwrap().total, 1);
        assert_eq!(ds.inner().dump("users").await.unwrap().len(), 2);

        // Deleted resources cannot be referenced.
        assert_eq!(
            ds.create("blogPosts", post("More notes", &ada)).await.unwrap_err(),
            Error::NoResource {
                path: "author".into(),
                id: ada.to_string()
            }
        );
    }

    #[async_std::test]
    async fn test_deleted_referrer() {
        // A hard-deleted resource may be referenced by soft-deleted ones.
        let ds = data_source().await;
        let acme = ds
            .create("companies", Value::object([("name", "Acme".into())]))
            .await
            .unwrap();
        let ada = ds
            .create(
                "users",
                Value::object([
                    ("name", "Ada".into()),
                    (
                        "jobs",
                        Value::array([Value::object([
                            ("title", "Analyst".into()),
                            ("company", Value::Id(acme.clone())),
                        ])]),
                    ),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(
            ds.delete("companies", &acme).await.unwrap_err(),
            Error::ResourceReferenced {
                resource: "users".into(),
                path: "jobs.company".into()
            }
        );
        assert!(ds.delete("users", &ada).await.unwrap());
        assert!(ds.delete("companies", &acme).await.unwrap());
    }

    #[async_std::test]
    async fn test_unknown_resource() {
        let ds = data_source().await;
        assert_eq!(
            ds.list("widgets", &Request::new()).await.unwrap_err(),
            Error::UnknownResource {
                resource: "widgets".into()
            }
        );
        assert_eq!(
            ds.create("users", Value::object([("nickname", "A".into())]))
                .await
                .unwrap_err(),
            Error::UnknownField {
                path: "nickname".into()
            }
        );
    }

    #[async_std::test]
    async fn test_connection_failed() {
        let ds = data_source().await;
        ds.inner().set_offline(true).await;
        let err = ds.list("users", &Request::new()).await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        assert!(err.is_retryable());

        ds.inner().set_offline(false).await;
        ds.list("users", &Request::new()).await.unwrap();
    }

    fn arbitrary_user() -> impl Strategy<Value = Value> {
        (
            "[a-zA-Z ]{1,12}",
            proptest::option::of(0i64..150),
            proptest::option::of("[a-z]{1,8}"),
            proptest::collection::vec("[a-z]{1,6}", 0..4),
        )
            .prop_map(|(name, age, city, tags)| {
                Value::object([
                    ("name", Value::String(name)),
                    ("age", age.into()),
                    (
                        "address",
                        match city {
                            Some(city) => Value::object([
                                ("city", Value::String(city)),
                                ("zip", Value::Null),
                            ]),
                            None => Value::Null,
                        },
                    ),
                    ("tags", Value::array(tags)),
                ])
            })
    }

    proptest! {
        #![proptest_config(Config {
            cases: 32,
            ..Default::default()
        })]

        #[test]
        fn test_create_view_inverse(payload in arbitrary_user()) {
            let viewed = block_on(async {
                let ds = data_source().await;
                let id = ds.create("users", payload.clone()).await.unwrap();
                let viewed = view(&ds, &id, &["name", "age", "address.*", "tags"]).await;
                (id, viewed)
            });
            let (id, viewed) = viewed;
            let Value::Object(mut expected) = payload else {
                unreachable!()
            };
            expected.insert("_id".into(), Value::Id(id));
            prop_assert_eq!(viewed, Some(Value::Object(expected)));
        }
    }
}
