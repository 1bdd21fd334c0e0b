use colldex::indexer::csharp::CSharpExtractor;
use colldex::model::AttributeRole;

fn extract(source: &str) -> colldex::indexer::extract::ExtractedFile {
    let mut extractor = CSharpExtractor::new().unwrap();
    extractor.extract(source, "src/Models.cs").unwrap()
}

#[test]
fn skips_abstract_static_and_interface_declarations() {
    let source = r#"
namespace Shop.Models;

public interface IEntity { string Id { get; } }
public abstract class EntityBase { public string Id { get; set; } }
public static class Helpers { public static int Twice(int x) => x * 2; }
public enum Status { Open, Closed }

public class Marker { }
"#;
    let output = extract(source);
    let names: Vec<&str> = output.types.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Marker"]);
    assert!(output.types[0].fields.is_empty());
    assert_eq!(output.types[0].namespace, "Shop.Models");
}

#[test]
fn bson_attributes_and_nullability() {
    let source = r#"
#nullable enable
using MongoDB.Bson;
using MongoDB.Bson.Serialization.Attributes;

namespace Shop.Models
{
    [BsonIgnoreExtraElements]
    public class User : EntityBase, IAuditable
    {
        [BsonId]
        [BsonRepresentation(BsonType.ObjectId)]
        public string Id { get; set; } = "";

        [BsonElement("user_name")]
        public string Name { get; set; } = "";

        public string? Nickname { get; set; }

        public int Age { get; set; }

        public DateTime? LastLogin { get; set; }

        [BsonIgnore]
        public string Scratch { get; set; } = "";
    }
}
"#;
    let output = extract(source);
    assert_eq!(output.types.len(), 1);
    let user = &output.types[0];
    assert_eq!(user.qualname(), "Shop.Models.User");
    assert_eq!(user.base_type.as_deref(), Some("EntityBase"));
    assert!(user
        .attributes
        .iter()
        .any(|a| a.role == AttributeRole::IgnoreExtraElements));

    let field = |name: &str| user.fields.iter().find(|f| f.name == name).unwrap();

    let id = field("Id");
    assert!(id.is_identity());
    assert!(id.has_role(AttributeRole::Representation));
    assert_eq!(id.stored_name(), "_id");
    assert!(!id.nullable);

    let name = field("Name");
    assert_eq!(name.stored_name(), "user_name");
    assert!(!name.nullable);

    assert!(field("Nickname").nullable);
    assert!(!field("Age").nullable);
    assert!(field("LastLogin").nullable);
    assert!(field("Scratch").is_skipped());
}

#[test]
fn reference_types_are_nullable_without_nullable_context() {
    let source = r#"
public class Order {
    public string Id { get; set; }
    public string UserId { get; set; }
    public decimal Total { get; set; }
    public List<LineItem> Items { get; set; }
}
"#;
    let output = extract(source);
    let order = &output.types[0];
    let user_id = order.fields.iter().find(|f| f.name == "UserId").unwrap();
    assert!(user_id.nullable);
    let total = order.fields.iter().find(|f| f.name == "Total").unwrap();
    assert!(!total.nullable);
    let items = order.fields.iter().find(|f| f.name == "Items").unwrap();
    assert!(items.is_collection());
    assert_eq!(items.declared_type, "List<LineItem>");
}

#[test]
fn record_parameters_become_fields() {
    let source = r#"
namespace Shop.Models;

public record Address(string Street, string City, int Zip);
"#;
    let output = extract(source);
    assert_eq!(output.types.len(), 1);
    let names: Vec<&str> = output.types[0]
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(names, vec!["Street", "City", "Zip"]);
}

#[test]
fn data_access_classes_are_not_document_types() {
    let source = r#"
public class UserRepository {
    private readonly IMongoCollection<User> _users;
    public UserRepository(IMongoDatabase db) {
        _users = db.GetCollection<User>("users");
    }
}

public class UserService {
    public void Run() { }
}
"#;
    let output = extract(source);
    assert!(output.types.is_empty());
    assert_eq!(output.hint_sites.len(), 1);
    assert_eq!(output.hint_sites[0].document_type, "User");
}

#[test]
fn generic_declarations_use_unparameterized_name() {
    let source = r#"
namespace Shop.Messaging;

public class Envelope<T> where T : class
{
    public string Id { get; set; }
    public T Payload { get; set; }
}
"#;
    let output = extract(source);
    assert_eq!(output.types.len(), 1);
    let envelope = &output.types[0];
    assert_eq!(envelope.name, "Envelope");
    assert_eq!(envelope.qualname(), "Shop.Messaging.Envelope");
    let fields: Vec<&str> = envelope.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(fields, vec!["Id", "Payload"]);
    assert_eq!(envelope.fields[1].declared_type, "T");
}
